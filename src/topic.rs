//! The closed topic enumeration and its wire attributes (spec §3, §6).

/// Direction of traffic for a topic, relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// JSON-vs-binary framing kind for a topic's plaintext body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Json,
    Binary,
}

/// Static attributes of a topic: which way it flows, whether it is
/// AES-256-GCM encrypted on the wire, and how its plaintext body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicAttrs {
    pub direction: Direction,
    pub encrypted: bool,
    pub kind: Kind,
}

/// The closed set of MQTT topics this client exchanges (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ConnectionFromClient,
    ConnectionFromService,
    CapabilitiesPublish,
    CapabilitiesAcknowledge,
    Directive,
    Event,
    Microphone,
    Speaker,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::ConnectionFromClient,
        Topic::ConnectionFromService,
        Topic::CapabilitiesPublish,
        Topic::CapabilitiesAcknowledge,
        Topic::Directive,
        Topic::Event,
        Topic::Microphone,
        Topic::Speaker,
    ];

    /// Suffix appended to the device's topic root on the wire (spec §6).
    pub fn suffix(self) -> &'static str {
        match self {
            Topic::ConnectionFromClient => "connection/fromclient",
            Topic::ConnectionFromService => "connection/fromservice",
            Topic::CapabilitiesPublish => "capabilities/publish",
            Topic::CapabilitiesAcknowledge => "capabilities/acknowledge",
            Topic::Directive => "directive",
            Topic::Event => "event",
            Topic::Microphone => "microphone",
            Topic::Speaker => "speaker",
        }
    }

    /// Recognize a topic from the suffix of a raw MQTT topic string, given
    /// the device's topic root (spec §4.6 step 1).
    pub fn from_full_topic(topic_root: &str, full_topic: &str) -> Option<Topic> {
        let prefix = format!("{topic_root}/");
        let suffix = full_topic.strip_prefix(&prefix)?;
        Topic::ALL.into_iter().find(|t| t.suffix() == suffix)
    }

    pub fn attrs(self) -> TopicAttrs {
        use Direction::*;
        use Kind::*;
        match self {
            Topic::ConnectionFromClient => TopicAttrs { direction: Out, encrypted: false, kind: Json },
            Topic::ConnectionFromService => TopicAttrs { direction: In, encrypted: false, kind: Json },
            Topic::CapabilitiesPublish => TopicAttrs { direction: Out, encrypted: false, kind: Json },
            Topic::CapabilitiesAcknowledge => TopicAttrs { direction: In, encrypted: true, kind: Json },
            Topic::Directive => TopicAttrs { direction: In, encrypted: true, kind: Json },
            Topic::Event => TopicAttrs { direction: Out, encrypted: true, kind: Json },
            Topic::Microphone => TopicAttrs { direction: Out, encrypted: true, kind: Binary },
            Topic::Speaker => TopicAttrs { direction: In, encrypted: true, kind: Binary },
        }
    }

    pub fn direction(self) -> Direction {
        self.attrs().direction
    }

    pub fn encrypted(self) -> bool {
        self.attrs().encrypted
    }

    /// The JSON array name wrapping a batch of messages in an encrypted
    /// JSON topic's plaintext body (spec §3).
    pub fn array_name(self) -> Option<&'static str> {
        match self {
            Topic::Directive => Some("directives"),
            Topic::Event => Some("events"),
            _ => None,
        }
    }
}
