pub mod hooks;
pub mod mesh_config;
pub mod mesh_node;
