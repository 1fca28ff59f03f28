use crate::core::uri::Uri;

/// The reason a session is being closed, carried on GOODBYE messages.
#[derive(Debug, Default, Clone, Copy)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    Killed,
    TimedOut,
    GoodbyeAndOut,
}

impl CloseReason {
    fn uri_component(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}
