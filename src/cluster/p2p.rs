//! libp2p transport for the fragment protocol
//!
//! Connections are TCP with Noise, so both ends prove their peer identity.
//! Requests travel as CBOR over request/response. The swarm lives in its own
//! task; callers talk to it through a command channel and get answers back
//! on oneshot channels.

use super::protocol::{FragmentRequest, FragmentResponse};
use super::service::FragmentService;
use super::transport::NodeTransport;
use super::TransportError;
use crate::crypto::random_32_bytes;
use crate::metadata::Server;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identify, noise,
    request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel},
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const PROTOCOL_VERSION: &str = "/shardvault/1.0.0";
const FRAGMENT_PROTOCOL: &str = "/shardvault/fragment/1.0.0";

#[derive(Debug, Clone)]
pub struct P2pTransportConfig {
    pub listen_addresses: Vec<Multiaddr>,

    /// File holding the node's identity seed (hex); created on first start
    pub key_path: PathBuf,

    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Combined network behaviour
#[derive(NetworkBehaviour)]
struct NodeBehaviour {
    identify: identify::Behaviour,
    fragments: request_response::cbor::Behaviour<FragmentRequest, FragmentResponse>,
}

type Reply = oneshot::Sender<Result<FragmentResponse, TransportError>>;

enum Command {
    Request {
        peer: PeerId,
        address: Multiaddr,
        request: FragmentRequest,
        reply: Reply,
    },
    AddAddress {
        peer: PeerId,
        address: Multiaddr,
    },
}

/// [`NodeTransport`] over a libp2p swarm
pub struct P2pTransport {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
}

impl P2pTransport {
    /// Build the swarm, start listening and spawn its event loop.
    ///
    /// Inbound requests are answered by `service`.
    pub async fn start(config: P2pTransportConfig, service: Arc<FragmentService>) -> Result<Self, TransportError> {
        let keypair = load_or_create_keypair(&config.key_path).await?;
        let local_peer_id = PeerId::from(keypair.public());
        tracing::info!("Starting fragment transport with PeerId: {}", local_peer_id);

        let mut swarm = build_swarm(keypair, &config)?;
        for address in &config.listen_addresses {
            swarm
                .listen_on(address.clone())
                .map_err(|e| TransportError::Network(e.to_string()))?;
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (responses, responses_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            swarm,
            commands: commands_rx,
            responses,
            responses_rx,
            pending: HashMap::new(),
            service,
        };
        tokio::spawn(event_loop.run());

        Ok(Self {
            local_peer_id,
            commands,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Teach the swarm where a peer can be dialled
    pub fn add_peer_address(&self, peer: PeerId, address: Multiaddr) -> Result<(), TransportError> {
        self.commands
            .send(Command::AddAddress { peer, address })
            .map_err(|_| TransportError::Network("transport event loop stopped".into()))
    }
}

#[async_trait]
impl NodeTransport for P2pTransport {
    async fn request(
        &self,
        server: &Server,
        request: FragmentRequest,
    ) -> Result<FragmentResponse, TransportError> {
        let peer = server_peer_id(server)?;
        let address = server_address(server)?;

        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Request {
                peer,
                address,
                request,
                reply,
            })
            .map_err(|_| TransportError::Network("transport event loop stopped".into()))?;

        answer
            .await
            .map_err(|_| TransportError::Network(format!("request to {} dropped", server.name)))?
    }
}

fn server_peer_id(server: &Server) -> Result<PeerId, TransportError> {
    let raw = server
        .peer_id
        .as_deref()
        .ok_or_else(|| TransportError::Unreachable(format!("{} advertises no peer id", server.name)))?;
    raw.parse::<PeerId>()
        .map_err(|e| TransportError::Protocol(format!("bad peer id for {}: {}", server.name, e)))
}

/// Dialable address of a roster entry
pub(crate) fn server_address(server: &Server) -> Result<Multiaddr, TransportError> {
    let host = match server.hostname.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("/ip4/{}", ip),
        Ok(IpAddr::V6(ip)) => format!("/ip6/{}", ip),
        Err(_) => format!("/dns/{}", server.hostname),
    };
    format!("{}/tcp/{}", host, server.port)
        .parse()
        .map_err(|e| TransportError::Protocol(format!("bad address for {}: {}", server.name, e)))
}

/// Load the identity seed at `path`, creating it on first use, and derive
/// the node's ed25519 keypair from it
pub(crate) async fn load_or_create_keypair(path: &Path) -> Result<libp2p::identity::Keypair, TransportError> {
    let seed = match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let bytes = hex::decode(text.trim())
                .map_err(|e| TransportError::Network(format!("corrupt node key: {}", e)))?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| TransportError::Network("node key must be 32 bytes".into()))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let seed = random_32_bytes();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransportError::Network(e.to_string()))?;
            }
            tokio::fs::write(path, hex::encode(seed))
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
            tracing::info!("Generated node key at {}", path.display());
            seed
        }
        Err(e) => return Err(TransportError::Network(e.to_string())),
    };
    derive_keypair(&seed)
}

fn derive_keypair(seed: &[u8; 32]) -> Result<libp2p::identity::Keypair, TransportError> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(Some(b"shardvault-libp2p"), seed);
    let mut libp2p_seed = [0u8; 32];
    hk.expand(b"libp2p-ed25519", &mut libp2p_seed)
        .map_err(|e| TransportError::Network(e.to_string()))?;

    let secret_key = libp2p::identity::ed25519::SecretKey::try_from_bytes(libp2p_seed)
        .map_err(|e| TransportError::Network(e.to_string()))?;
    let keypair = libp2p::identity::ed25519::Keypair::from(secret_key);
    Ok(libp2p::identity::Keypair::from(keypair))
}

fn build_swarm(
    keypair: libp2p::identity::Keypair,
    config: &P2pTransportConfig,
) -> Result<Swarm<NodeBehaviour>, TransportError> {
    let request_timeout = config.request_timeout;
    let idle_timeout = config.idle_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| TransportError::Network(e.to_string()))?
        .with_dns()
        .map_err(|e| TransportError::Network(e.to_string()))?
        .with_behaviour(|keypair| {
            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), keypair.public())
                    .with_agent_version(format!("shardvault/{}", env!("CARGO_PKG_VERSION"))),
            );

            let fragments = request_response::cbor::Behaviour::new(
                [(StreamProtocol::new(FRAGMENT_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(request_timeout),
            );

            NodeBehaviour {
                identify,
                fragments,
            }
        })
        .map_err(|e| TransportError::Network(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

struct EventLoop {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    responses: mpsc::UnboundedSender<(ResponseChannel<FragmentResponse>, FragmentResponse)>,
    responses_rx: mpsc::UnboundedReceiver<(ResponseChannel<FragmentResponse>, FragmentResponse)>,
    pending: HashMap<OutboundRequestId, Reply>,
    service: Arc<FragmentService>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((channel, response)) = self.responses_rx.recv() => {
                    if self.swarm.behaviour_mut().fragments.send_response(channel, response).is_err() {
                        tracing::debug!("Peer went away before the response was sent");
                    }
                }
            }
        }
        tracing::info!("Fragment transport stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                peer,
                address,
                request,
                reply,
            } => {
                self.swarm.add_peer_address(peer, address);
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .fragments
                    .send_request(&peer, request);
                self.pending.insert(request_id, reply);
            }
            Command::AddAddress { peer, address } => {
                self.swarm.add_peer_address(peer, address);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                tracing::debug!("Connected to {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                tracing::debug!("Disconnected from {}", peer_id);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Fragments(event)) => {
                self.handle_fragment_event(event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                tracing::debug!(
                    "Identified peer {}: {} ({})",
                    peer_id,
                    info.agent_version,
                    info.protocol_version
                );
            }
            _ => {}
        }
    }

    fn handle_fragment_event(&mut self, event: request_response::Event<FragmentRequest, FragmentResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    tracing::debug!("{} request from {}", request.kind(), peer);
                    let service = self.service.clone();
                    let responses = self.responses.clone();
                    tokio::spawn(async move {
                        let response = service.handle(request).await;
                        let _ = responses.send((channel, response));
                    });
                }
                request_response::Message::Response { request_id, response } => {
                    if let Some(reply) = self.pending.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                tracing::debug!("Request to {} failed: {}", peer, error);
                if let Some(reply) = self.pending.remove(&request_id) {
                    let _ = reply.send(Err(TransportError::Unreachable(format!("{}: {}", peer, error))));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                tracing::warn!("Inbound request from {} failed: {}", peer, error);
            }
            _ => {}
        }
    }
}
