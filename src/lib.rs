pub mod error;
pub mod messaging;
pub mod node;
pub mod port;
pub mod pull;
pub mod relay;
pub mod test_util;
pub mod util;
