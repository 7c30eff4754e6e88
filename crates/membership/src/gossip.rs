//! Gossip node: peer discovery, failure detection and user-event broadcast.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::event::{Event, Member, MemberStatus};
use crate::message::{Message, read_frame, write_frame};

/// Capacity of the event channel handed to the embedding application.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Timeout for dialling a peer.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Gossip layer configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Local endpoint to listen on.
    pub bind: Address,
    /// Endpoint peers should contact, when it differs from `bind` (NAT).
    pub advertise: Option<Address>,
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    /// Silence after which a member is declared failed.
    pub failure_timeout: Duration,
    /// Time a failed member lingers before being reaped.
    pub reap_timeout: Duration,
}

impl GossipConfig {
    /// Configuration with default timing for `bind`.
    pub fn new(bind: Address) -> Self {
        Self {
            bind,
            advertise: None,
            probe_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(3),
            reap_timeout: Duration::from_secs(30),
        }
    }

    /// The endpoint other nodes reach us on.
    pub fn real_addr(&self) -> &Address {
        self.advertise.as_ref().unwrap_or(&self.bind)
    }
}

struct MemberState {
    member: Member,
    status: MemberStatus,
    last_seen: Instant,
}

/// A gossip node.
///
/// Tracks the live member set, detects failures via periodic probes, and
/// floods user events to every member. Cluster events are delivered on a
/// bounded channel obtained from [`Gossip::take_event_receiver`].
pub struct Gossip {
    local: Member,
    config: GossipConfig,
    members: DashMap<String, MemberState>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    event_seq: AtomicU64,
    seen_events: Mutex<HashSet<(String, u64)>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gossip {
    /// Bind the gossip listener and start the background tasks.
    ///
    /// The local node's own join event is the first event delivered.
    pub async fn new(config: GossipConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind.socket_addr()?).await?;
        let local = Member::new(config.real_addr().clone());
        info!(node = %local.name, "gossip listening on {}", config.bind);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let gossip = Arc::new(Self {
            local: local.clone(),
            config,
            members: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            event_seq: AtomicU64::new(0),
            seen_events: Mutex::new(HashSet::new()),
            shutdown_tx,
        });

        gossip.deliver(Event::MemberJoin(local), false).await;
        gossip.clone().spawn_listener(listener);
        gossip.clone().spawn_prober();

        Ok(gossip)
    }

    /// The local member record.
    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// Take the cluster event receiver. Yields `Some` exactly once.
    pub async fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().await.take()
    }

    /// Every member currently believed alive, the local node included.
    pub fn members(&self) -> Vec<Member> {
        let mut members = vec![self.local.clone()];
        for entry in self.members.iter() {
            if entry.status == MemberStatus::Alive {
                members.push(entry.member.clone());
            }
        }
        members
    }

    /// Contact `peers` and merge their member lists.
    ///
    /// Returns how many seeds answered; failing to reach every seed is an
    /// error. The local node then introduces itself to every discovered
    /// member so the whole cluster observes the join.
    pub async fn join(&self, peers: &[String]) -> Result<usize> {
        let mut joined = 0;
        let mut discovered: Vec<Member> = Vec::new();

        for peer in peers {
            let addr = Address::parse(peer)?;
            match self.introduce(&addr).await {
                Ok(members) => {
                    joined += 1;
                    discovered.extend(members);
                }
                Err(e) => warn!(peer = %peer, "could not join seed: {e}"),
            }
        }

        if joined == 0 {
            return Err(Error::JoinFailed);
        }

        for member in discovered {
            if member.name == self.local.name {
                continue;
            }
            if self.admit(member.clone()).await {
                // Members beyond the seed have not heard from us yet.
                if let Err(e) = self.introduce(&member.addr).await {
                    debug!(member = %member.name, "introduction failed: {e}");
                }
            }
        }

        Ok(joined)
    }

    /// Broadcast an arbitrary payload to every member, the local node
    /// included.
    ///
    /// With `coalesce` set the delivery may be dropped on nodes whose event
    /// queue is saturated.
    pub async fn user_event(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let message = Message::User {
            origin: self.local.name.clone(),
            seq,
            name: name.to_string(),
            payload: payload.clone(),
            coalesce,
        };

        self.deliver(
            Event::User {
                name: name.to_string(),
                payload,
            },
            coalesce,
        )
        .await;

        for member in self.members() {
            if member.name == self.local.name {
                continue;
            }
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = send_to(&member.addr, &message).await {
                    debug!(member = %member.name, "user event send failed: {e}");
                }
            });
        }

        Ok(())
    }

    /// Announce a graceful departure to every member.
    pub async fn leave(&self) {
        let message = Message::Leave {
            name: self.local.name.clone(),
        };
        for member in self.members() {
            if member.name == self.local.name {
                continue;
            }
            if let Err(e) = send_to(&member.addr, &message).await {
                debug!(member = %member.name, "leave notification failed: {e}");
            }
        }
    }

    /// Stop the listener and prober tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_listener(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let gossip = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gossip.handle_connection(stream).await {
                                    debug!(%peer, "gossip connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("gossip accept failed: {e}"),
                    },
                    _ = shutdown_rx.recv() => {
                        debug!("gossip listener shutting down");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_prober(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.probe_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.probe_round().await,
                    _ = shutdown_rx.recv() => {
                        debug!("gossip prober shutting down");
                        break;
                    }
                }
            }
        });
    }

    async fn probe_round(&self) {
        let mut failed = Vec::new();
        let mut reaped = Vec::new();
        let mut targets = Vec::new();

        for mut entry in self.members.iter_mut() {
            let idle = entry.last_seen.elapsed();
            match entry.status {
                MemberStatus::Alive if idle > self.config.failure_timeout => {
                    entry.status = MemberStatus::Failed;
                    failed.push(entry.member.clone());
                }
                MemberStatus::Alive => targets.push(entry.member.clone()),
                MemberStatus::Failed if idle > self.config.reap_timeout => {
                    reaped.push(entry.member.clone());
                }
                MemberStatus::Failed => {}
            }
        }

        for member in reaped {
            self.members.remove(&member.name);
            info!(member = %member.name, "reaping failed member");
            self.deliver(Event::MemberReap(member), false).await;
        }
        for member in failed {
            info!(member = %member.name, "member failed");
            self.deliver(Event::MemberFailed(member), false).await;
        }

        targets.shuffle(&mut rand::thread_rng());
        let ping = Message::Ping {
            from: self.local.clone(),
        };
        for member in targets {
            let ping = ping.clone();
            tokio::spawn(async move {
                if let Err(e) = send_to(&member.addr, &ping).await {
                    debug!(member = %member.name, "probe failed: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let message = match read_frame(&mut stream).await {
                Ok(message) => message,
                // Peers close the connection once done sending.
                Err(Error::Io(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            match message {
                Message::Join { member } => {
                    self.admit(member).await;
                    let reply = Message::Members {
                        members: self.members(),
                    };
                    write_frame(&mut stream, &reply).await?;
                }
                Message::Members { members } => {
                    for member in members {
                        self.admit(member).await;
                    }
                }
                Message::Ping { from } => {
                    self.admit(from).await;
                }
                Message::Leave { name } => {
                    if let Some((_, state)) = self.members.remove(&name) {
                        info!(member = %name, "member left");
                        self.deliver(Event::MemberLeave(state.member), false).await;
                    }
                }
                Message::User {
                    origin,
                    seq,
                    name,
                    payload,
                    coalesce,
                } => {
                    let fresh = self.seen_events.lock().await.insert((origin, seq));
                    if fresh {
                        self.deliver(Event::User { name, payload }, coalesce).await;
                    }
                }
            }
        }
    }

    /// Record a member as alive, emitting a join event when it is new or
    /// coming back from the failed state. Returns whether the event fired.
    async fn admit(&self, member: Member) -> bool {
        if member.name == self.local.name {
            return false;
        }

        let rejoined = match self.members.get_mut(&member.name) {
            Some(mut state) => {
                state.last_seen = Instant::now();
                let was_failed = state.status == MemberStatus::Failed;
                state.status = MemberStatus::Alive;
                was_failed
            }
            None => {
                self.members.insert(
                    member.name.clone(),
                    MemberState {
                        member: member.clone(),
                        status: MemberStatus::Alive,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        };

        if rejoined {
            info!(member = %member.name, "member joined");
            self.deliver(Event::MemberJoin(member), false).await;
        }
        rejoined
    }

    async fn deliver(&self, event: Event, droppable: bool) {
        if droppable {
            if let Err(e) = self.events_tx.try_send(event) {
                debug!("dropping coalesced event: {e}");
            }
        } else if self.events_tx.send(event).await.is_err() {
            debug!("event receiver is gone");
        }
    }

    /// Dial `addr`, send our member record and collect the peer's view.
    async fn introduce(&self, addr: &Address) -> Result<Vec<Member>> {
        let mut stream = dial(addr).await?;
        write_frame(
            &mut stream,
            &Message::Join {
                member: self.local.clone(),
            },
        )
        .await?;

        match timeout(DIAL_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(Message::Members { members })) => Ok(members),
            Ok(Ok(_)) | Err(_) => Ok(Vec::new()),
            Ok(Err(e)) => Err(e),
        }
    }
}

impl std::fmt::Debug for Gossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gossip")
            .field("local", &self.local.name)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

async fn dial(addr: &Address) -> Result<TcpStream> {
    let socket = addr.socket_addr()?;
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(socket))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dialling {addr} timed out"),
            ))
        })??;
    Ok(stream)
}

async fn send_to(addr: &Address, message: &Message) -> Result<()> {
    let mut stream = dial(addr).await?;
    write_frame(&mut stream, message).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(port: u16) -> GossipConfig {
        GossipConfig::new(Address::new("127.0.0.1", port))
    }

    async fn next_member_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn own_join_is_the_first_event() {
        let gossip = Gossip::new(local_config(17800)).await.unwrap();
        let mut rx = gossip.take_event_receiver().await.unwrap();

        match next_member_event(&mut rx).await {
            Event::MemberJoin(member) => assert_eq!(member.name, "127.0.0.1:17800"),
            other => panic!("unexpected event: {other:?}"),
        }
        gossip.shutdown();
    }

    #[tokio::test]
    async fn receiver_can_only_be_taken_once() {
        let gossip = Gossip::new(local_config(17810)).await.unwrap();
        assert!(gossip.take_event_receiver().await.is_some());
        assert!(gossip.take_event_receiver().await.is_none());
        gossip.shutdown();
    }

    #[tokio::test]
    async fn two_nodes_observe_each_other() {
        let a = Gossip::new(local_config(17820)).await.unwrap();
        let b = Gossip::new(local_config(17830)).await.unwrap();
        let mut rx_a = a.take_event_receiver().await.unwrap();
        let mut rx_b = b.take_event_receiver().await.unwrap();

        // Self joins.
        assert!(matches!(
            next_member_event(&mut rx_a).await,
            Event::MemberJoin(_)
        ));
        assert!(matches!(
            next_member_event(&mut rx_b).await,
            Event::MemberJoin(_)
        ));

        let joined = b.join(&["127.0.0.1:17820".to_string()]).await.unwrap();
        assert_eq!(joined, 1);

        match next_member_event(&mut rx_a).await {
            Event::MemberJoin(member) => assert_eq!(member.name, "127.0.0.1:17830"),
            other => panic!("unexpected event on a: {other:?}"),
        }
        match next_member_event(&mut rx_b).await {
            Event::MemberJoin(member) => assert_eq!(member.name, "127.0.0.1:17820"),
            other => panic!("unexpected event on b: {other:?}"),
        }

        assert_eq!(a.members().len(), 2);
        assert_eq!(b.members().len(), 2);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn user_events_reach_every_node_once() {
        let a = Gossip::new(local_config(17840)).await.unwrap();
        let b = Gossip::new(local_config(17850)).await.unwrap();
        let mut rx_a = a.take_event_receiver().await.unwrap();
        let mut rx_b = b.take_event_receiver().await.unwrap();

        b.join(&["127.0.0.1:17840".to_string()]).await.unwrap();

        // Drain the self join and the peer join on both sides.
        for rx in [&mut rx_a, &mut rx_b] {
            for _ in 0..2 {
                match next_member_event(rx).await {
                    Event::MemberJoin(_) => {}
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }

        b.user_event("apply", b"payload".to_vec(), false)
            .await
            .unwrap();

        // The sender observes its own event, the peer exactly one copy.
        match next_member_event(&mut rx_b).await {
            Event::User { name, payload } => {
                assert_eq!(name, "apply");
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected event on b: {other:?}"),
        }
        match next_member_event(&mut rx_a).await {
            Event::User { name, .. } => assert_eq!(name, "apply"),
            other => panic!("unexpected event on a: {other:?}"),
        }

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn graceful_leave_is_announced() {
        let a = Gossip::new(local_config(17860)).await.unwrap();
        let b = Gossip::new(local_config(17870)).await.unwrap();
        let mut rx_a = a.take_event_receiver().await.unwrap();

        b.join(&["127.0.0.1:17860".to_string()]).await.unwrap();

        // Self join + b's join.
        assert!(matches!(
            next_member_event(&mut rx_a).await,
            Event::MemberJoin(_)
        ));
        assert!(matches!(
            next_member_event(&mut rx_a).await,
            Event::MemberJoin(_)
        ));

        b.leave().await;
        b.shutdown();

        match next_member_event(&mut rx_a).await {
            Event::MemberLeave(member) => assert_eq!(member.name, "127.0.0.1:17870"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(a.members().len(), 1);

        a.shutdown();
    }

    #[tokio::test]
    async fn silent_members_are_failed_then_reaped() {
        let mut config_a = local_config(17890);
        config_a.probe_interval = Duration::from_millis(200);
        config_a.failure_timeout = Duration::from_millis(800);
        config_a.reap_timeout = Duration::from_secs(2);

        let a = Gossip::new(config_a).await.unwrap();
        let b = Gossip::new(local_config(17891)).await.unwrap();
        let mut rx_a = a.take_event_receiver().await.unwrap();

        b.join(&["127.0.0.1:17890".to_string()]).await.unwrap();

        // Self join + b's join.
        assert!(matches!(
            next_member_event(&mut rx_a).await,
            Event::MemberJoin(_)
        ));
        assert!(matches!(
            next_member_event(&mut rx_a).await,
            Event::MemberJoin(_)
        ));

        // Kill b without a goodbye; its silence fails it, then reaps it.
        b.shutdown();
        drop(b);

        match next_member_event(&mut rx_a).await {
            Event::MemberFailed(member) => assert_eq!(member.name, "127.0.0.1:17891"),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_member_event(&mut rx_a).await {
            Event::MemberReap(member) => assert_eq!(member.name, "127.0.0.1:17891"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(a.members().len(), 1);

        a.shutdown();
    }

    #[tokio::test]
    async fn join_with_no_reachable_seed_fails() {
        let gossip = Gossip::new(local_config(17880)).await.unwrap();
        let err = gossip
            .join(&["127.0.0.1:1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JoinFailed));
        gossip.shutdown();
    }
}
