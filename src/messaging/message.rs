use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use serde_json::Value;

use crate::pull::End;
use crate::util::uid::unique_id;


pub type MessageId = String;
pub type PortId = String;

/// Optional hints attached to a message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MeshMeta {
    /// keep-alive interval (in milliseconds) the sender of a request wants its provider to use
    ///  for `Continue` messages
    pub cont: Option<u64>,
}
impl MeshMeta {
    pub fn with_cont(cont: Duration) -> MeshMeta {
        MeshMeta { cont: Some(cont.as_millis() as u64) }
    }

    pub fn cont_interval(&self) -> Option<Duration> {
        self.cont
            .filter(|&millis| millis > 0)
            .map(Duration::from_millis)
    }
}

/// Payload of `Open` and `Req`: a request for more data, or, if `abort` is set, the request to
///  stop producing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestData {
    pub source_uri: String,
    pub dest_uri: String,
    /// the requesting port's own id
    pub port_id: PortId,
    pub abort: Option<End>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResData {
    pub source_uri: String,
    pub dest_uri: String,
    /// id of the port the response is addressed to
    pub peer_port_id: PortId,
    pub reply_id: MessageId,
    pub payload: Vec<Value>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContinueData {
    pub source_uri: String,
    pub dest_uri: String,
    pub peer_port_id: PortId,
    pub reply_id: MessageId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndData {
    pub source_uri: String,
    pub dest_uri: String,
    pub peer_port_id: PortId,
    pub reply_id: MessageId,
    pub end: End,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SinkEndData {
    pub source_uri: String,
    pub dest_uri: String,
    /// the sending port's own id
    pub port_id: PortId,
    pub end: End,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Open(RequestData),
    Req(RequestData),
    Res(ResData),
    Continue(ContinueData),
    End(EndData),
    SinkEnd(SinkEndData),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandKind {
    Open,
    Req,
    Res,
    Continue,
    End,
    SinkEnd,
}
impl CommandKind {
    pub fn tag(&self) -> &'static str {
        match self {
            CommandKind::Open => "open",
            CommandKind::Req => "req",
            CommandKind::Res => "res",
            CommandKind::Continue => "con",
            CommandKind::End => "end",
            CommandKind::SinkEnd => "sinkEnd",
        }
    }

    pub fn from_tag(tag: &str) -> Option<CommandKind> {
        match tag {
            "open" => Some(CommandKind::Open),
            "req" => Some(CommandKind::Req),
            "res" => Some(CommandKind::Res),
            "con" => Some(CommandKind::Continue),
            "end" => Some(CommandKind::End),
            "sinkEnd" => Some(CommandKind::SinkEnd),
            _ => None,
        }
    }
}
impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// The unit of transfer in the mesh. Messages are immutable once created: routing code that
///  needs to change URIs creates a modified copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub meta: MeshMeta,
    pub command: Command,
}

impl Message {
    pub fn new(command: Command) -> Message {
        Message {
            id: unique_id(),
            meta: MeshMeta::default(),
            command,
        }
    }

    pub fn with_meta(mut self, meta: MeshMeta) -> Message {
        self.meta = meta;
        self
    }

    pub fn kind(&self) -> CommandKind {
        match &self.command {
            Command::Open(_) => CommandKind::Open,
            Command::Req(_) => CommandKind::Req,
            Command::Res(_) => CommandKind::Res,
            Command::Continue(_) => CommandKind::Continue,
            Command::End(_) => CommandKind::End,
            Command::SinkEnd(_) => CommandKind::SinkEnd,
        }
    }

    pub fn source_uri(&self) -> &str {
        match &self.command {
            Command::Open(d) | Command::Req(d) => &d.source_uri,
            Command::Res(d) => &d.source_uri,
            Command::Continue(d) => &d.source_uri,
            Command::End(d) => &d.source_uri,
            Command::SinkEnd(d) => &d.source_uri,
        }
    }

    pub fn dest_uri(&self) -> &str {
        match &self.command {
            Command::Open(d) | Command::Req(d) => &d.dest_uri,
            Command::Res(d) => &d.dest_uri,
            Command::Continue(d) => &d.dest_uri,
            Command::End(d) => &d.dest_uri,
            Command::SinkEnd(d) => &d.dest_uri,
        }
    }

    /// Returns a copy with both URIs transformed by `f`, keeping the id.
    pub fn map_uris(&self, f: impl Fn(&str) -> String) -> Message {
        let mut result = self.clone();
        let (source_uri, dest_uri) = match &mut result.command {
            Command::Open(d) | Command::Req(d) => (&mut d.source_uri, &mut d.dest_uri),
            Command::Res(d) => (&mut d.source_uri, &mut d.dest_uri),
            Command::Continue(d) => (&mut d.source_uri, &mut d.dest_uri),
            Command::End(d) => (&mut d.source_uri, &mut d.dest_uri),
            Command::SinkEnd(d) => (&mut d.source_uri, &mut d.dest_uri),
        };
        let mapped_source = f(source_uri);
        let mapped_dest = f(dest_uri);
        *source_uri = mapped_source;
        *dest_uri = mapped_dest;
        result
    }
}


/// What travels over a relay link: the link's first frame carries the sender's URI variables,
///  all following frames carry messages.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayFrame {
    Vars(BTreeMap<String, String>),
    Message(Message),
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn res() -> Message {
        Message::new(Command::Res(ResData {
            source_uri: "a/b".to_string(),
            dest_uri: "c/b".to_string(),
            peer_port_id: "p".to_string(),
            reply_id: "r".to_string(),
            payload: vec![Value::from(1)],
        }))
    }

    #[rstest]
    #[case::open("open", Some(CommandKind::Open))]
    #[case::req("req", Some(CommandKind::Req))]
    #[case::res("res", Some(CommandKind::Res))]
    #[case::cont("con", Some(CommandKind::Continue))]
    #[case::end("end", Some(CommandKind::End))]
    #[case::sink_end("sinkEnd", Some(CommandKind::SinkEnd))]
    #[case::unknown("xyz", None)]
    fn test_command_kind_tag(#[case] tag: &str, #[case] expected: Option<CommandKind>) {
        assert_eq!(CommandKind::from_tag(tag), expected);
        if let Some(kind) = expected {
            assert_eq!(kind.tag(), tag);
        }
    }

    #[test]
    fn test_map_uris() {
        let msg = res();
        let mapped = msg.map_uris(|s| s.replace("b", "x"));

        assert_eq!(mapped.id, msg.id);
        assert_eq!(mapped.source_uri(), "a/x");
        assert_eq!(mapped.dest_uri(), "c/x");
        assert_eq!(mapped.kind(), CommandKind::Res);
        assert_eq!(msg.source_uri(), "a/b");
    }

    #[rstest]
    #[case::none(None, None)]
    #[case::zero(Some(0), None)]
    #[case::some(Some(666), Some(Duration::from_millis(666)))]
    fn test_cont_interval(#[case] cont: Option<u64>, #[case] expected: Option<Duration>) {
        assert_eq!(MeshMeta { cont }.cont_interval(), expected);
    }

    #[test]
    fn test_fresh_ids() {
        assert_ne!(res().id, res().id);
    }
}
