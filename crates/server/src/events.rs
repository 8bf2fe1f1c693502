use drift::RelayEvent;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started { description: String },
    Relay(RelayEvent),
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl ServerEvent {
    pub fn severity(&self) -> Severity {
        match self {
            ServerEvent::Started { .. } => Severity::Info,
            ServerEvent::Relay(RelayEvent::Rejected { .. } | RelayEvent::Anomaly { .. }) => {
                Severity::Warn
            }
            ServerEvent::Relay(_) => Severity::Info,
            ServerEvent::Error { .. } => Severity::Error,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ServerEvent::Started { description } => description.clone(),
            ServerEvent::Relay(event) => match event {
                RelayEvent::Joined {
                    identifier,
                    endpoint,
                } => format!("{} joined from {}", identifier, endpoint),
                RelayEvent::Rejected { endpoint, reason } => {
                    format!("Rejected {}: {}", endpoint, reason)
                }
                RelayEvent::Left { identifier, reason } => {
                    format!("{} {}", identifier, reason.as_str())
                }
                RelayEvent::Pinged { identifier } => format!("Pinged silent {}", identifier),
                RelayEvent::Anomaly {
                    endpoint,
                    description,
                } => format!("{}: {}", endpoint, description),
            },
            ServerEvent::Error { message } => message.clone(),
        }
    }
}

impl From<RelayEvent> for ServerEvent {
    fn from(event: RelayEvent) -> Self {
        ServerEvent::Relay(event)
    }
}
