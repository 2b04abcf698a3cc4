use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::codec::Deframer;
use crate::config::Config;
use crate::metadata::Metadata;
use crate::protocol::{RequestHead, CONTENT_TYPE_GRPC};
use crate::stream::{pump_client_response, RpcStream};
use crate::Error;

/// A client connection to one gRPC endpoint.
///
/// `Channel::new(host, port)` builds an unconnected channel; `connect`
/// performs the TCP (and TLS) handshake and spawns the HTTP/2 connection
/// driver. Channels clone cheaply and all clones share the connection.
#[derive(Clone)]
pub struct Channel {
    host: String,
    port: u16,
    config: Config,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::ClientTlsConfig>,
    connected: Option<Connected>,
}

#[derive(Clone)]
struct Connected {
    send_request: h2::client::SendRequest<Bytes>,
    scheme: &'static str,
    authority: String,
    // Live client streams by id; used to tear pumps down on close.
    streams: Arc<Mutex<HashMap<u32, AbortHandle>>>,
}

impl Channel {
    pub fn new(host: impl Into<String>, port: u16) -> Channel {
        Channel {
            host: host.into(),
            port,
            config: Config::default(),
            #[cfg(feature = "tls")]
            tls: None,
            connected: None,
        }
    }

    /// Cap on a single message payload in either direction. Defaults to
    /// 4 MiB.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.config.max_message_size = limit;
        self
    }

    /// Timeout applied to calls that do not set one explicitly.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// The `user-agent` sent with every request.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Connect over TLS.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, tls: crate::tls::ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Establish the connection. Transport failures surface as
    /// [`Error::Unavailable`].
    pub async fn connect(&mut self) -> Result<(), Error> {
        let authority = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|err| {
                Error::Unavailable(format!("failed to connect to {}: {}", authority, err))
            })?;
        let _ = tcp.set_nodelay(true);

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            let (connector, server_name) = tls.build_connector(&self.host)?;
            let io = connector.connect(server_name, tcp).await.map_err(|err| {
                Error::Unavailable(format!("tls handshake with {} failed: {}", authority, err))
            })?;
            let send_request = handshake(io).await?;
            self.connected = Some(Connected {
                send_request,
                scheme: "https",
                authority,
                streams: Arc::new(Mutex::new(HashMap::new())),
            });
            return Ok(());
        }

        let send_request = handshake(tcp).await?;
        self.connected = Some(Connected {
            send_request,
            scheme: "http",
            authority,
            streams: Arc::new(Mutex::new(HashMap::new())),
        });
        Ok(())
    }

    /// Drop the connection. In-flight streams observe `Unavailable`.
    pub fn close(&mut self) {
        if let Some(connected) = self.connected.take() {
            for (_, handle) in connected.streams.lock().unwrap().drain() {
                handle.abort();
            }
        }
    }

    /// Open a new RPC stream: allocates the next client stream id, sends
    /// the request headers and returns the stream ready for messages.
    pub async fn new_stream(
        &self,
        service: &str,
        method: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<RpcStream, Error> {
        self.open_stream(service, method, metadata, timeout, None)
            .await
    }

    pub(crate) async fn open_stream(
        &self,
        service: &str,
        method: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
        message_type: Option<String>,
    ) -> Result<RpcStream, Error> {
        let connected = self
            .connected
            .as_ref()
            .ok_or_else(|| Error::Unavailable("channel is not connected".into()))?;

        let head = RequestHead {
            // The real id is known once h2 assigns it below.
            stream_id: 0,
            scheme: connected.scheme.into(),
            service: service.into(),
            method: method.into(),
            content_type: CONTENT_TYPE_GRPC.into(),
            authority: Some(connected.authority.clone()),
            timeout: timeout.or(self.config.default_timeout),
            message_encoding: None,
            message_accept_encoding: Vec::new(),
            user_agent: Some(self.config.user_agent.clone()),
            message_type,
            metadata,
        };
        let request = head.to_http()?;

        // `ready` waits for stream capacity under the server's
        // max_concurrent_streams setting.
        let mut send_request = connected
            .send_request
            .clone()
            .ready()
            .await
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        let (response, send_stream) = send_request
            .send_request(request, false)
            .map_err(|err| Error::Unavailable(err.to_string()))?;
        let stream_id = u32::from(response.stream_id());

        trace!(id = stream_id, service, method, "stream opened");

        let (tx, rx) = mpsc::channel(self.config.inbound_queue);
        let deframer = Deframer::new(self.config.max_message_size);

        let streams = connected.streams.clone();
        let pump = tokio::spawn(async move {
            pump_client_response(response, tx, deframer, stream_id).await;
            streams.lock().unwrap().remove(&stream_id);
        });

        let previous = connected
            .streams
            .lock()
            .unwrap()
            .insert(stream_id, pump.abort_handle());
        debug_assert!(previous.is_none(), "stream id {} reused", stream_id);
        if pump.is_finished() {
            // The pump beat the insert; drop the stale entry.
            connected.streams.lock().unwrap().remove(&stream_id);
        }

        Ok(RpcStream::client(
            stream_id,
            send_stream,
            rx,
            self.config.max_message_size,
        ))
    }
}

async fn handshake<IO>(io: IO) -> Result<h2::client::SendRequest<Bytes>, Error>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, connection) = h2::client::handshake(io)
        .await
        .map_err(|err| Error::Unavailable(format!("h2 handshake failed: {}", err)))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("connection task failed: {}", err);
        }
    });

    Ok(send_request)
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.connected.is_some())
            .finish()
    }
}
