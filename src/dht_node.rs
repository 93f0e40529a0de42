//! The single-UDP-address Kademlia engine: query dispatch, routing table
//! maintenance, and local BEP44/tracker storage.
//!
//! Grounded on `examples/Thoxy67-mainline/src/dht.rs`'s actor shape (a
//! cloneable handle around a channel sender, talking to a run loop that
//! owns all mutable state) and on `original_source/src/bittorrent/dht.cpp`
//! for the query/response semantics the teacher's partial source doesn't
//! include. The run loop is a tokio task rather than an OS thread, since
//! everything it awaits (socket I/O, the recursive lookups in
//! [crate::lookup]) is already tokio-native.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::id::Id;
use crate::lookup::{self, QueryOutcome};
use crate::martian::is_martian;
use crate::messages::{
    error_code, AnnouncePeerArguments, ErrorSpecific, FindNodeArguments, FindNodeResponseArguments,
    GetArguments, GetPeersArguments, GetPeersResponseArguments, GetResponseArguments, Message,
    MessageVariant, PingArguments, PingResponseArguments, PutArguments, QuerySpecific,
    ResponseSpecific,
};
use crate::mutable_item::{ImmutableItem, MutableItem};
use crate::node::{decode_peers_v4, NodeContact};
use crate::routing_table::{PingSink, RoutingTable};
use crate::socket::Socket;
use crate::store::DataStore;
use crate::tracker::Tracker;
use crate::transaction::{encode_transaction_id, TransactionIdAllocator, TransactionTable};
use crate::{Error, LookupError, Result};

/// Bootstrap nodes for the public mainline network (spec.md §4.5).
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.aelitis.com:6881",
];

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

const K: usize = 8;
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a single [DhtNode].
#[derive(Debug, Clone)]
pub struct Config {
    pub bootstrap: Vec<String>,
    pub bind_addr: SocketAddr,
    pub request_timeout: Duration,
    pub external_ip: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            external_ip: None,
        }
    }
}

/// A running DHT engine bound to one UDP address.
///
/// Cheaply cloneable; clones share the same background task via an
/// `mpsc::UnboundedSender<Command>`, mirroring the teacher's
/// `Dht(Sender<ActorMessage>)` handle-around-a-channel shape.
#[derive(Clone)]
pub struct DhtNode {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

enum Command {
    FindNode {
        target: Id,
        reply: oneshot::Sender<Vec<NodeContact>>,
    },
    GetPeers {
        info_hash: Id,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    AnnouncePeer {
        info_hash: Id,
        port: Option<u16>,
        reply: oneshot::Sender<Result<()>>,
    },
    GetImmutable {
        target: Id,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    PutImmutable {
        item: ImmutableItem,
        reply: oneshot::Sender<Result<Id>>,
    },
    GetMutable {
        public_key: [u8; 32],
        salt: Option<Vec<u8>>,
        reply: oneshot::Sender<Option<MutableItem>>,
    },
    PutMutable {
        item: MutableItem,
        cas: Option<i64>,
        reply: oneshot::Sender<Result<Id>>,
    },
    SelfId {
        reply: oneshot::Sender<Id>,
    },
    RoutingTableLen {
        reply: oneshot::Sender<usize>,
    },
    Ping {
        to: SocketAddr,
        reply: oneshot::Sender<Result<Id>>,
    },
}

impl DhtNode {
    pub async fn bind(config: Config) -> std::io::Result<Self> {
        let socket = Arc::new(Socket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let self_id = match config.external_ip {
            Some(ip) => Id::from_ip(ip, rand::random::<u8>() & 0x7),
            None => Id::random(),
        };

        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let routing_table = Arc::new(SyncMutex::new(RoutingTable::new(
            self_id,
            Box::new(ChannelPingSink(ping_tx)),
        )));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner = Inner {
            self_id,
            socket,
            routing_table,
            transactions: Arc::new(TransactionTable::default()),
            transaction_ids: Arc::new(TransactionIdAllocator::default()),
            store: Arc::new(SyncMutex::new(DataStore::new())),
            tracker: Arc::new(SyncMutex::new(Tracker::new())),
            request_timeout: config.request_timeout,
        };

        let node = Self {
            commands: commands_tx,
            local_addr,
            cancel: cancel.clone(),
        };

        tokio::spawn(run(inner, commands_rx, ping_rx, config.bootstrap, cancel));

        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn self_id(&self) -> Result<Id> {
        self.call(|reply| Command::SelfId { reply }).await
    }

    pub async fn routing_table_len(&self) -> Result<usize> {
        self.call(|reply| Command::RoutingTableLen { reply }).await
    }

    pub async fn ping(&self, to: SocketAddr) -> Result<Id> {
        self.call(|reply| Command::Ping { to, reply }).await?
    }

    pub async fn find_node(&self, target: Id) -> Result<Vec<NodeContact>> {
        self.call(|reply| Command::FindNode { target, reply }).await
    }

    pub async fn get_peers(&self, info_hash: Id) -> Result<Vec<SocketAddr>, LookupError> {
        let peers = self
            .call(|reply| Command::GetPeers { info_hash, reply })
            .await
            .map_err(|_| LookupError::NoContactReached)?;
        if peers.is_empty() {
            Err(LookupError::NoPeersFound)
        } else {
            Ok(peers)
        }
    }

    pub async fn announce_peer(&self, info_hash: Id, port: Option<u16>) -> Result<(), Error> {
        self.call(|reply| Command::AnnouncePeer { info_hash, port, reply })
            .await?
    }

    pub async fn get_immutable(&self, target: Id) -> Result<Option<Vec<u8>>> {
        self.call(|reply| Command::GetImmutable { target, reply }).await
    }

    pub async fn put_immutable(&self, value: Vec<u8>) -> Result<Id> {
        let item = ImmutableItem::new(value);
        self.call(|reply| Command::PutImmutable { item, reply }).await?
    }

    pub async fn get_mutable(
        &self,
        public_key: [u8; 32],
        salt: Option<Vec<u8>>,
    ) -> Result<Option<MutableItem>> {
        self.call(|reply| Command::GetMutable { public_key, salt, reply }).await
    }

    pub async fn put_mutable(&self, item: MutableItem, cas: Option<i64>) -> Result<Id> {
        self.call(|reply| Command::PutMutable { item, cas, reply }).await?
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

struct ChannelPingSink(mpsc::UnboundedSender<NodeContact>);

impl PingSink for ChannelPingSink {
    fn ping(&self, contact: NodeContact) {
        let _ = self.0.send(contact);
    }
}

#[derive(Clone)]
struct Inner {
    self_id: Id,
    socket: Arc<Socket>,
    routing_table: Arc<SyncMutex<RoutingTable>>,
    transactions: Arc<TransactionTable>,
    transaction_ids: Arc<TransactionIdAllocator>,
    store: Arc<SyncMutex<DataStore>>,
    tracker: Arc<SyncMutex<Tracker>>,
    request_timeout: Duration,
}

async fn run(
    inner: Inner,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut ping_requests: mpsc::UnboundedReceiver<NodeContact>,
    bootstrap: Vec<String>,
    cancel: CancellationToken,
) {
    let mut recv_buf = vec![0u8; 8192];
    let mut tick = tokio::time::interval(TICK_INTERVAL);

    let bootstrap_inner = inner.clone();
    tokio::spawn(async move {
        if let Err(err) = bootstrap_routing_table(&bootstrap_inner, &bootstrap).await {
            warn!(?err, "bootstrap failed");
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            recv = inner.socket.recv_from(&mut recv_buf) => {
                match recv {
                    Ok((n, from)) => handle_datagram(&inner, &recv_buf[..n], from).await,
                    Err(err) => warn!(?err, "udp recv error"),
                }
            }

            Some(contact) = ping_requests.recv() => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let _ = query_ping(&inner, contact.endpoint).await;
                });
            }

            Some(command) = commands.recv() => {
                let inner = inner.clone();
                tokio::spawn(handle_command(inner, command));
            }

            _ = tick.tick() => {
                inner.store.lock().unwrap().tick();
                inner.tracker.lock().unwrap().tick();
            }
        }
    }
}

async fn handle_command(inner: Inner, command: Command) {
    match command {
        Command::SelfId { reply } => {
            let _ = reply.send(inner.self_id);
        }
        Command::Ping { to, reply } => {
            let _ = reply.send(query_ping(&inner, to).await);
        }
        Command::RoutingTableLen { reply } => {
            let _ = reply.send(inner.routing_table.lock().unwrap().len());
        }
        Command::FindNode { target, reply } => {
            let closest = lookup_closest(&inner, target).await;
            let _ = reply.send(closest);
        }
        Command::GetPeers { info_hash, reply } => {
            let peers = get_peers_lookup(&inner, info_hash).await;
            let _ = reply.send(peers);
        }
        Command::AnnouncePeer { info_hash, port, reply } => {
            let result = announce_peer_lookup(&inner, info_hash, port).await;
            let _ = reply.send(result);
        }
        Command::GetImmutable { target, reply } => {
            if let Some(item) = inner.store.lock().unwrap().get_immutable(&target) {
                let _ = reply.send(Some(item.value.clone()));
                return;
            }
            let value = get_value_lookup(&inner, target, None).await;
            let _ = reply.send(value.and_then(|v| v.immutable));
        }
        Command::PutImmutable { item, reply } => {
            let target = item.target();
            inner.store.lock().unwrap().put_immutable(item.clone());
            let result = put_lookup(&inner, target, PutPayload::Immutable(item)).await;
            let _ = reply.send(result.map(|_| target));
        }
        Command::GetMutable { public_key, salt, reply } => {
            let target = MutableItem::target_from_key(&public_key, salt.as_deref());
            if let Some(item) = inner.store.lock().unwrap().get_mutable(&target) {
                let _ = reply.send(Some(item.clone()));
                return;
            }
            let value = get_value_lookup(&inner, target, Some((public_key, salt))).await;
            let _ = reply.send(value.and_then(|v| v.mutable));
        }
        Command::PutMutable { item, cas, reply } => {
            let target = item.target();
            let result = inner.store.lock().unwrap().put_mutable(item.clone(), cas);
            if let Err(err) = result {
                let _ = reply.send(Err(err));
                return;
            }
            let result = put_lookup(&inner, target, PutPayload::Mutable(item, cas)).await;
            let _ = reply.send(result.map(|_| target));
        }
    }
}

async fn bootstrap_routing_table(inner: &Inner, bootstrap: &[String]) -> Result<()> {
    let mut any_responded = false;
    for host in bootstrap {
        let Ok(mut addrs) = tokio::net::lookup_host(host).await else {
            continue;
        };
        let Some(addr) = addrs.find(|a| a.is_ipv4()) else {
            continue;
        };
        if query_ping(inner, addr).await.is_ok() {
            any_responded = true;
            let _ = find_node_query(inner, addr, inner.self_id).await;
        }
    }
    if !any_responded && !bootstrap.is_empty() {
        return Err(Error::BootstrapFailed);
    }
    Ok(())
}

// === Lookups, built on `crate::lookup::collect` ===

async fn lookup_closest(inner: &Inner, target: Id) -> Vec<NodeContact> {
    let seeds = inner.routing_table.lock().unwrap().find_closest(target, K);
    let inner = inner.clone();
    lookup::collect(target, seeds, K, lookup::DEFAULT_CONCURRENCY, CancellationToken::new(), {
        let inner = inner.clone();
        move |contact| {
            let inner = inner.clone();
            async move { find_node_query(&inner, contact.endpoint, target).await }
        }
    })
    .await
}

async fn find_node_query(inner: &Inner, to: SocketAddr, target: Id) -> QueryOutcome {
    let args = FindNodeArguments {
        id: inner.self_id.as_bytes().to_vec(),
        target: target.as_bytes().to_vec(),
    };
    match send_query(inner, to, QuerySpecific::FindNode { arguments: args }).await {
        Ok(Message { variant: MessageVariant::Response(ResponseSpecific::FindNode { arguments }), .. }) => {
            record_good(inner, to, &arguments.id);
            QueryOutcome::Nodes(parse_nodes(&arguments))
        }
        _ => {
            record_failure(inner, to);
            QueryOutcome::Failed
        }
    }
}

fn parse_nodes(args: &FindNodeResponseArguments) -> Vec<NodeContact> {
    let mut out = Vec::new();
    if let Some(nodes) = &args.nodes {
        if let Ok(list) = NodeContact::decode_compact_v4_list(nodes) {
            out.extend(list);
        }
    }
    if let Some(nodes6) = &args.nodes6 {
        if let Ok(list) = NodeContact::decode_compact_v6_list(nodes6) {
            out.extend(list);
        }
    }
    out
}

struct PeerQueryResult {
    peers: Vec<SocketAddr>,
    token: Option<Vec<u8>>,
}

async fn get_peers_lookup(inner: &Inner, info_hash: Id) -> Vec<SocketAddr> {
    let seeds = inner.routing_table.lock().unwrap().find_closest(info_hash, K);
    let found = Arc::new(SyncMutex::new(Vec::<SocketAddr>::new()));

    let found_clone = Arc::clone(&found);
    let inner = inner.clone();
    lookup::collect(info_hash, seeds, K, lookup::DEFAULT_CONCURRENCY, CancellationToken::new(), {
        move |contact| {
            let inner = inner.clone();
            let found = Arc::clone(&found_clone);
            async move {
                let result = get_peers_query(&inner, contact.endpoint, info_hash).await;
                match result {
                    Some((nodes, peer_result)) => {
                        found.lock().unwrap().extend(peer_result.peers);
                        QueryOutcome::Nodes(nodes)
                    }
                    None => QueryOutcome::Failed,
                }
            }
        }
    })
    .await;

    let mut peers = found.lock().unwrap().clone();
    peers.sort();
    peers.dedup();
    peers
}

async fn get_peers_query(
    inner: &Inner,
    to: SocketAddr,
    info_hash: Id,
) -> Option<(Vec<NodeContact>, PeerQueryResult)> {
    let args = GetPeersArguments {
        id: inner.self_id.as_bytes().to_vec(),
        info_hash: info_hash.as_bytes().to_vec(),
    };
    match send_query(inner, to, QuerySpecific::GetPeers { arguments: args }).await {
        Ok(Message { variant: MessageVariant::Response(ResponseSpecific::GetPeers { arguments }), .. }) => {
            record_good(inner, to, &arguments.id);
            let nodes = parse_nodes(&FindNodeResponseArguments {
                id: arguments.id.clone(),
                nodes: arguments.nodes.clone(),
                nodes6: arguments.nodes6.clone(),
            });
            let peers = decode_peer_values(&arguments);
            Some((
                nodes,
                PeerQueryResult {
                    peers,
                    token: Some(arguments.token),
                },
            ))
        }
        _ => {
            record_failure(inner, to);
            None
        }
    }
}

fn decode_peer_values(args: &GetPeersResponseArguments) -> Vec<SocketAddr> {
    args.values
        .as_ref()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| decode_peers_v4(v).ok())
                .flatten()
                .filter(|addr| !is_martian(addr))
                .collect()
        })
        .unwrap_or_default()
}

async fn announce_peer_lookup(inner: &Inner, info_hash: Id, port: Option<u16>) -> Result<()> {
    let seeds = inner.routing_table.lock().unwrap().find_closest(info_hash, K);
    let tokens: Arc<SyncMutex<Vec<(SocketAddr, Vec<u8>)>>> = Arc::new(SyncMutex::new(Vec::new()));

    let tokens_clone = Arc::clone(&tokens);
    let inner_clone = inner.clone();
    lookup::collect(info_hash, seeds, K, lookup::DEFAULT_CONCURRENCY, CancellationToken::new(), {
        move |contact| {
            let inner = inner_clone.clone();
            let tokens = Arc::clone(&tokens_clone);
            async move {
                match get_peers_query(&inner, contact.endpoint, info_hash).await {
                    Some((nodes, result)) => {
                        if let Some(token) = result.token {
                            tokens.lock().unwrap().push((contact.endpoint, token));
                        }
                        QueryOutcome::Nodes(nodes)
                    }
                    None => QueryOutcome::Failed,
                }
            }
        }
    })
    .await;

    let targets = tokens.lock().unwrap().clone();
    if targets.is_empty() {
        return Err(Error::NetworkUnreachable);
    }

    let mut accepted = false;
    for (to, token) in targets {
        let (port, implied_port) = match port {
            Some(port) => (port, None),
            None => (0, Some(1u8)),
        };
        let args = AnnouncePeerArguments {
            id: inner.self_id.as_bytes().to_vec(),
            info_hash: info_hash.as_bytes().to_vec(),
            port,
            token,
            implied_port,
        };
        if send_query(inner, to, QuerySpecific::AnnouncePeer { arguments: args })
            .await
            .is_ok()
        {
            accepted = true;
        }
    }

    if accepted {
        Ok(())
    } else {
        Err(Error::PublicationFailed)
    }
}

struct FoundValue {
    immutable: Option<Vec<u8>>,
    mutable: Option<MutableItem>,
}

async fn get_value_lookup(
    inner: &Inner,
    target: Id,
    mutable_key: Option<([u8; 32], Option<Vec<u8>>)>,
) -> Option<FoundValue> {
    let seeds = inner.routing_table.lock().unwrap().find_closest(target, K);
    let found: Arc<SyncMutex<Option<FoundValue>>> = Arc::new(SyncMutex::new(None));

    let found_clone = Arc::clone(&found);
    let inner = inner.clone();
    lookup::collect(target, seeds, K, lookup::DEFAULT_CONCURRENCY, CancellationToken::new(), {
        move |contact| {
            let inner = inner.clone();
            let found = Arc::clone(&found_clone);
            async move {
                let args = GetArguments {
                    id: inner.self_id.as_bytes().to_vec(),
                    target: target.as_bytes().to_vec(),
                    seq: None,
                };
                match send_query(&inner, contact.endpoint, QuerySpecific::Get { arguments: args }).await {
                    Ok(Message { variant: MessageVariant::Response(ResponseSpecific::Get { arguments }), .. }) => {
                        record_good(&inner, contact.endpoint, &arguments.id);
                        let nodes = parse_nodes(&FindNodeResponseArguments {
                            id: arguments.id.clone(),
                            nodes: arguments.nodes.clone(),
                            nodes6: arguments.nodes6.clone(),
                        });
                        if let Some(v) = &arguments.v {
                            let mut guard = found.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(extract_value(v, &arguments));
                            }
                        }
                        QueryOutcome::Nodes(nodes)
                    }
                    _ => {
                        record_failure(&inner, contact.endpoint);
                        QueryOutcome::Failed
                    }
                }
            }
        }
    })
    .await;

    let _ = mutable_key;
    Arc::try_unwrap(found).map(|m| m.into_inner().unwrap()).unwrap_or(None)
}

fn extract_value(v: &[u8], args: &GetResponseArguments) -> FoundValue {
    match (&args.k, &args.sig) {
        (Some(k), Some(sig)) if k.len() == 32 && sig.len() == 64 => {
            let mut public_key = [0u8; 32];
            public_key.copy_from_slice(k);
            let mut signature = [0u8; 64];
            signature.copy_from_slice(sig);
            FoundValue {
                immutable: None,
                mutable: Some(MutableItem {
                    public_key,
                    salt: None,
                    value: v.to_vec(),
                    seq: args.seq.unwrap_or(0),
                    signature,
                }),
            }
        }
        _ => FoundValue {
            immutable: Some(v.to_vec()),
            mutable: None,
        },
    }
}

enum PutPayload {
    Immutable(ImmutableItem),
    Mutable(MutableItem, Option<i64>),
}

async fn put_lookup(inner: &Inner, target: Id, payload: PutPayload) -> Result<()> {
    let seeds = inner.routing_table.lock().unwrap().find_closest(target, K);
    let tokens: Arc<SyncMutex<Vec<(SocketAddr, Vec<u8>)>>> = Arc::new(SyncMutex::new(Vec::new()));

    let tokens_clone = Arc::clone(&tokens);
    let inner_clone = inner.clone();
    lookup::collect(target, seeds, K, lookup::DEFAULT_CONCURRENCY, CancellationToken::new(), {
        move |contact| {
            let inner = inner_clone.clone();
            let tokens = Arc::clone(&tokens_clone);
            async move {
                let args = GetArguments {
                    id: inner.self_id.as_bytes().to_vec(),
                    target: target.as_bytes().to_vec(),
                    seq: None,
                };
                match send_query(&inner, contact.endpoint, QuerySpecific::Get { arguments: args }).await {
                    Ok(Message { variant: MessageVariant::Response(ResponseSpecific::Get { arguments }), .. }) => {
                        record_good(&inner, contact.endpoint, &arguments.id);
                        tokens.lock().unwrap().push((contact.endpoint, arguments.token.clone()));
                        let nodes = parse_nodes(&FindNodeResponseArguments {
                            id: arguments.id.clone(),
                            nodes: arguments.nodes.clone(),
                            nodes6: arguments.nodes6.clone(),
                        });
                        QueryOutcome::Nodes(nodes)
                    }
                    _ => {
                        record_failure(&inner, contact.endpoint);
                        QueryOutcome::Failed
                    }
                }
            }
        }
    })
    .await;

    let targets = tokens.lock().unwrap().clone();
    if targets.is_empty() {
        return Err(Error::NetworkUnreachable);
    }

    let mut accepted = false;
    for (to, token) in targets {
        let args = match &payload {
            PutPayload::Immutable(item) => PutArguments {
                id: inner.self_id.as_bytes().to_vec(),
                token,
                v: item.value.clone(),
                k: None,
                sig: None,
                seq: None,
                salt: None,
                cas: None,
            },
            PutPayload::Mutable(item, cas) => PutArguments {
                id: inner.self_id.as_bytes().to_vec(),
                token,
                v: item.value.clone(),
                k: Some(item.public_key.to_vec()),
                sig: Some(item.signature.to_vec()),
                seq: Some(item.seq),
                salt: item.salt.clone(),
                cas: *cas,
            },
        };

        if send_query(inner, to, QuerySpecific::Put { arguments: args }).await.is_ok() {
            accepted = true;
        }
    }

    if accepted {
        Ok(())
    } else {
        Err(Error::PublicationFailed)
    }
}

// === Wire I/O ===

async fn send_query(inner: &Inner, to: SocketAddr, query: QuerySpecific) -> Result<Message> {
    if is_martian(&to) {
        return Err(Error::NetworkUnreachable);
    }

    let transaction_id = inner.transaction_ids.next();
    let message = Message {
        transaction_id: encode_transaction_id(transaction_id),
        version: None,
        read_only: None,
        variant: MessageVariant::Query(query),
    };

    let rx = inner.transactions.register(to, transaction_id);
    inner.socket.send_to(&message.to_bytes()?, to).await?;

    match tokio::time::timeout(inner.request_timeout, rx).await {
        Ok(Ok(reply)) => {
            if let MessageVariant::Error(e) = &reply.variant {
                let code = e.code().unwrap_or(0);
                if code == error_code::NOT_RESPONSIBLE {
                    return Err(Error::NotResponsible);
                }
                return Err(Error::PeerError { code, description: e.description() });
            }
            Ok(reply)
        }
        _ => {
            inner.transactions.cancel(to, transaction_id);
            Err(Error::Timeout(Some(to)))
        }
    }
}

async fn query_ping(inner: &Inner, to: SocketAddr) -> Result<Id> {
    let args = PingArguments { id: inner.self_id.as_bytes().to_vec() };
    match send_query(inner, to, QuerySpecific::Ping { arguments: args }).await? {
        Message { variant: MessageVariant::Response(ResponseSpecific::Ping { arguments }), .. } => {
            let id = Id::from_bytestring(&arguments.id)?;
            record_good(inner, to, &arguments.id);
            Ok(id)
        }
        _ => Err(Error::Protocol("unexpected reply to ping")),
    }
}

fn record_good(inner: &Inner, from: SocketAddr, id_bytes: &[u8]) {
    if let Ok(id) = Id::from_bytestring(id_bytes) {
        inner
            .routing_table
            .lock()
            .unwrap()
            .try_add(NodeContact::new(id, from), true);
    }
}

fn record_failure(inner: &Inner, from: SocketAddr) {
    let mut table = inner.routing_table.lock().unwrap();
    if let Some(contact) = table.dump().into_iter().find(|c| c.endpoint == from) {
        table.fail(contact);
    }
}

async fn handle_datagram(inner: &Inner, bytes: &[u8], from: SocketAddr) {
    let message = match Message::from_bytes(bytes) {
        Ok(m) => m,
        Err(err) => {
            debug!(?from, ?err, "dropping malformed datagram");
            return;
        }
    };

    match &message.variant {
        MessageVariant::Query(query) => handle_query(inner, message.transaction_id.clone(), query, from).await,
        MessageVariant::Response(_) | MessageVariant::Error(_) => {
            inner.transactions.resolve(from, message);
        }
    }
}

fn query_sender_id(query: &QuerySpecific) -> &[u8] {
    match query {
        QuerySpecific::Ping { arguments } => &arguments.id,
        QuerySpecific::FindNode { arguments } => &arguments.id,
        QuerySpecific::GetPeers { arguments } => &arguments.id,
        QuerySpecific::AnnouncePeer { arguments } => &arguments.id,
        QuerySpecific::Get { arguments } => &arguments.id,
        QuerySpecific::Put { arguments } => &arguments.id,
    }
}

async fn handle_query(inner: &Inner, transaction_id: Vec<u8>, query: &QuerySpecific, from: SocketAddr) {
    // A node that sends us a well-formed query has, by definition, reached
    // us over UDP; treat it the same as a successful outgoing-query
    // response for routing-table purposes (original_source/dht.cpp adds
    // both directions of contact, not just ones this node initiated).
    record_good(inner, from, query_sender_id(query));

    let response = match query {
        QuerySpecific::Ping { .. } => MessageVariant::Response(ResponseSpecific::Ping {
            arguments: PingResponseArguments { id: inner.self_id.as_bytes().to_vec() },
        }),
        QuerySpecific::FindNode { arguments } => {
            let Ok(target) = Id::from_bytestring(&arguments.target) else {
                return send_error(inner, from, transaction_id, error_code::PROTOCOL_ERROR, "bad target").await;
            };
            let closest = inner.routing_table.lock().unwrap().find_closest(target, K);
            let (nodes, nodes6) = NodeContact::encode_compact_list(&closest);
            MessageVariant::Response(ResponseSpecific::FindNode {
                arguments: FindNodeResponseArguments {
                    id: inner.self_id.as_bytes().to_vec(),
                    nodes: (!nodes.is_empty()).then_some(nodes),
                    nodes6: (!nodes6.is_empty()).then_some(nodes6),
                },
            })
        }
        QuerySpecific::GetPeers { arguments } => {
            let Ok(info_hash) = Id::from_bytestring(&arguments.info_hash) else {
                return send_error(inner, from, transaction_id, error_code::PROTOCOL_ERROR, "bad info_hash").await;
            };
            let token = inner.tracker.lock().unwrap().generate_token(from.ip(), info_hash);
            let peers = inner.tracker.lock().unwrap().get_peers(&info_hash, 50);
            let closest = inner.routing_table.lock().unwrap().find_closest(info_hash, K);
            let (nodes, nodes6) = NodeContact::encode_compact_list(&closest);
            let values = peers
                .into_iter()
                .map(|addr| {
                    let mut buf = Vec::new();
                    crate::node::encode_endpoint(&addr, &mut buf);
                    serde_bytes::ByteBuf::from(buf)
                })
                .collect::<Vec<_>>();
            MessageVariant::Response(ResponseSpecific::GetPeers {
                arguments: GetPeersResponseArguments {
                    id: inner.self_id.as_bytes().to_vec(),
                    token,
                    nodes: (!nodes.is_empty()).then_some(nodes),
                    nodes6: (!nodes6.is_empty()).then_some(nodes6),
                    values: (!values.is_empty()).then_some(values),
                },
            })
        }
        QuerySpecific::AnnouncePeer { arguments } => {
            let Ok(info_hash) = Id::from_bytestring(&arguments.info_hash) else {
                return send_error(inner, from, transaction_id, error_code::PROTOCOL_ERROR, "bad info_hash").await;
            };
            if !inner.routing_table.lock().unwrap().is_responsible_for(info_hash) {
                return send_error(inner, from, transaction_id, error_code::NOT_RESPONSIBLE, "not responsible").await;
            }
            if !inner.tracker.lock().unwrap().verify_token(from.ip(), info_hash, &arguments.token) {
                return send_error(inner, from, transaction_id, error_code::PROTOCOL_ERROR, "bad token").await;
            }
            let port = if arguments.implied_port == Some(1) { from.port() } else { arguments.port };
            inner
                .tracker
                .lock()
                .unwrap()
                .add_peer(info_hash, SocketAddr::new(from.ip(), port));
            MessageVariant::Response(ResponseSpecific::Ping {
                arguments: PingResponseArguments { id: inner.self_id.as_bytes().to_vec() },
            })
        }
        QuerySpecific::Get { arguments } => {
            let Ok(target) = Id::from_bytestring(&arguments.target) else {
                return send_error(inner, from, transaction_id, error_code::PROTOCOL_ERROR, "bad target").await;
            };
            let token = inner.store.lock().unwrap().generate_token(from.ip(), target);
            let closest = inner.routing_table.lock().unwrap().find_closest(target, K);
            let (nodes, nodes6) = NodeContact::encode_compact_list(&closest);

            let store = inner.store.lock().unwrap();
            let (v, k, sig, seq) = if let Some(item) = store.get_mutable(&target) {
                (Some(item.value.clone()), Some(item.public_key.to_vec()), Some(item.signature.to_vec()), Some(item.seq))
            } else if let Some(item) = store.get_immutable(&target) {
                (Some(item.value.clone()), None, None, None)
            } else {
                (None, None, None, None)
            };
            drop(store);

            MessageVariant::Response(ResponseSpecific::Get {
                arguments: GetResponseArguments {
                    id: inner.self_id.as_bytes().to_vec(),
                    token,
                    nodes: (!nodes.is_empty()).then_some(nodes),
                    nodes6: (!nodes6.is_empty()).then_some(nodes6),
                    v,
                    k,
                    sig,
                    seq,
                },
            })
        }
        QuerySpecific::Put { arguments } => match handle_put(inner, from, arguments).await {
            Ok(()) => MessageVariant::Response(ResponseSpecific::Ping {
                arguments: PingResponseArguments { id: inner.self_id.as_bytes().to_vec() },
            }),
            Err((code, description)) => {
                return send_error(inner, from, transaction_id, code, description).await;
            }
        },
    };

    let reply = Message { transaction_id, version: None, read_only: None, variant: response };
    if let Ok(bytes) = reply.to_bytes() {
        let _ = inner.socket.send_to(&bytes, from).await;
    }
}

async fn handle_put(inner: &Inner, from: SocketAddr, args: &PutArguments) -> std::result::Result<(), (i32, &'static str)> {
    let target = match (&args.k, &args.sig) {
        (Some(k), Some(_)) if k.len() == 32 => {
            let mut public_key = [0u8; 32];
            public_key.copy_from_slice(k);
            MutableItem::target_from_key(&public_key, args.salt.as_deref())
        }
        _ => ImmutableItem::new(args.v.clone()).target(),
    };

    if !inner.routing_table.lock().unwrap().is_responsible_for(target) {
        return Err((error_code::NOT_RESPONSIBLE, "not responsible"));
    }

    if !inner.store.lock().unwrap().verify_token(from.ip(), target, &args.token) {
        return Err((error_code::PROTOCOL_ERROR, "bad token"));
    }

    match (&args.k, &args.sig) {
        (Some(k), Some(sig)) if k.len() == 32 && sig.len() == 64 => {
            let mut public_key = [0u8; 32];
            public_key.copy_from_slice(k);
            let mut signature = [0u8; 64];
            signature.copy_from_slice(sig);
            let item = MutableItem {
                public_key,
                salt: args.salt.clone(),
                value: args.v.clone(),
                seq: args.seq.unwrap_or(0),
                signature,
            };
            inner
                .store
                .lock()
                .unwrap()
                .put_mutable(item, args.cas)
                .map_err(map_put_error)
        }
        _ => {
            if args.v.len() >= crate::mutable_item::MAX_ENCODED_VALUE_SIZE {
                return Err((error_code::VALUE_TOO_BIG, "value too big"));
            }
            inner.store.lock().unwrap().put_immutable(ImmutableItem::new(args.v.clone()));
            Ok(())
        }
    }
}

fn map_put_error(err: Error) -> (i32, &'static str) {
    match err {
        Error::CasMismatch => (error_code::CAS_MISMATCH, "cas mismatch"),
        Error::SequenceNotUpdated => (error_code::SEQUENCE_NOT_UPDATED, "sequence not updated"),
        Error::InvalidSignature => (error_code::INVALID_SIGNATURE, "invalid signature"),
        Error::ValueTooBig => (error_code::VALUE_TOO_BIG, "value too big"),
        Error::SaltTooBig => (error_code::SALT_TOO_BIG, "salt too big"),
        _ => (error_code::PROTOCOL_ERROR, "rejected"),
    }
}

async fn send_error(inner: &Inner, to: SocketAddr, transaction_id: Vec<u8>, code: i32, description: &str) {
    let message = Message {
        transaction_id,
        version: None,
        read_only: None,
        variant: MessageVariant::Error(ErrorSpecific::new(code, description)),
    };
    if let Ok(bytes) = message.to_bytes() {
        let _ = inner.socket.send_to(&bytes, to).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn node() -> DhtNode {
        DhtNode::bind(Config {
            bootstrap: vec![],
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            request_timeout: Duration::from_millis(200),
            external_ip: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn ping_between_two_local_nodes() {
        let a = node().await;
        let b = node().await;

        let b_id = a.ping(b.local_addr()).await.unwrap();
        assert_eq!(b_id, b.self_id().await.unwrap());

        // `a` should now know about `b`.
        assert_eq!(a.routing_table_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_node_with_no_peers_returns_self_lookup_only() {
        let a = node().await;
        let target = Id::random();
        let closest = a.find_node(target).await.unwrap();
        assert!(closest.is_empty());
    }

    #[tokio::test]
    async fn put_get_immutable_no_peers() {
        let a = node().await;
        assert_eq!(a.get_immutable(Id::random()).await.unwrap(), None);
    }
}
