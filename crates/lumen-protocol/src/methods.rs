//! The method table of the session-level server interface

use std::fmt;

/// Every operation a client can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    CreateSurface,
    NextBuffer,
    SubmitBuffer,
    ReleaseSurface,
    ConfigureDisplay,
    CreateScreencast,
    ScreencastBuffer,
    ReleaseScreencast,
    Disconnect,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::Connect,
        Method::CreateSurface,
        Method::NextBuffer,
        Method::SubmitBuffer,
        Method::ReleaseSurface,
        Method::ConfigureDisplay,
        Method::CreateScreencast,
        Method::ScreencastBuffer,
        Method::ReleaseScreencast,
        Method::Disconnect,
    ];

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::CreateSurface => "create_surface",
            Method::NextBuffer => "next_buffer",
            Method::SubmitBuffer => "submit_buffer",
            Method::ReleaseSurface => "release_surface",
            Method::ConfigureDisplay => "configure_display",
            Method::CreateScreencast => "create_screencast",
            Method::ScreencastBuffer => "screencast_buffer",
            Method::ReleaseScreencast => "release_screencast",
            Method::Disconnect => "disconnect",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// After this method the server stops reading from the connection
    pub fn is_terminal(self) -> bool {
        matches!(self, Method::Disconnect)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
