use crate::Error;

/// Which side of the RPC this stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The observable state of one RPC stream.
///
/// Streams move `Idle → HeadersSent → Open`, half-close on each side
/// independently, and end `Closed` once both halves are done:
///
/// ```text
/// Idle → HeadersSent → Open → HalfClosedLocal | HalfClosedRemote → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    HeadersSent,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Role-aware transition tracking for one stream.
///
/// Local misuse (sending after close, closing twice) fails the offending
/// call only; the stream itself is not torn down.
#[derive(Debug)]
pub(crate) struct StateMachine {
    role: Role,
    local_headers_sent: bool,
    remote_open: bool,
    local_closed: bool,
    remote_closed: bool,
}

impl StateMachine {
    /// A client stream starts idle; nothing has hit the wire yet.
    pub(crate) fn client() -> Self {
        StateMachine {
            role: Role::Client,
            local_headers_sent: false,
            remote_open: false,
            local_closed: false,
            remote_closed: false,
        }
    }

    /// A server stream is created by an inbound request, so its remote half
    /// is open from the start.
    pub(crate) fn server() -> Self {
        StateMachine {
            role: Role::Server,
            local_headers_sent: false,
            remote_open: true,
            local_closed: false,
            remote_closed: false,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        match (self.local_closed, self.remote_closed) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) => match self.role {
                Role::Server => StreamState::Open,
                Role::Client => {
                    if !self.local_headers_sent {
                        StreamState::Idle
                    } else if self.remote_open {
                        StreamState::Open
                    } else {
                        StreamState::HeadersSent
                    }
                }
            },
        }
    }

    /// Local headers go out exactly once, before any message.
    pub(crate) fn send_headers(&mut self) -> Result<(), Error> {
        if self.local_closed {
            return Err(Error::InvalidState("stream closed locally"));
        }
        if self.local_headers_sent {
            return Err(Error::InvalidState("headers already sent"));
        }
        self.local_headers_sent = true;
        Ok(())
    }

    /// Messages are legal only while the local side is open.
    pub(crate) fn send_message(&mut self) -> Result<(), Error> {
        if !self.local_headers_sent {
            return Err(Error::InvalidState("cannot send a message before headers"));
        }
        if self.local_closed {
            return Err(Error::InvalidState("cannot send a message after local close"));
        }
        Ok(())
    }

    pub(crate) fn close_local(&mut self) -> Result<(), Error> {
        if self.local_closed {
            return Err(Error::InvalidState("stream already closed locally"));
        }
        self.local_closed = true;
        Ok(())
    }

    /// Response headers arrived (client role).
    pub(crate) fn recv_headers(&mut self) {
        self.remote_open = true;
    }

    /// `RequestEnded` / `ResponseEnded` observed.
    pub(crate) fn close_remote(&mut self) {
        self.remote_open = true;
        self.remote_closed = true;
    }

    /// RST_STREAM in either direction ends both halves at once.
    pub(crate) fn cancel(&mut self) {
        self.local_closed = true;
        self.remote_closed = true;
    }
}
