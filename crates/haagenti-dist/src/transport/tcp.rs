//! TCP star transport: rank 0 hosts the hub, every other rank is a leaf

use super::protocol::{read_frame, write_frame, Frame};
use super::Transport;
use crate::value::{Buffer, ReduceOp};
use crate::{DistError, Result};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Poll interval of the hub's accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Pause between a leaf's connect attempts
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// Time an accepted connection gets to introduce itself
const HELLO_WAIT: Duration = Duration::from_secs(5);
/// Upper bound of a single connect attempt
const CONNECT_ATTEMPT: Duration = Duration::from_secs(1);

/// Rendezvous parameters of one member
#[derive(Debug, Clone, PartialEq)]
pub struct Rendezvous {
    /// Hub host
    pub master_addr: String,
    /// Hub port
    pub master_port: u16,
    /// Rank of this member
    pub rank: usize,
    /// Number of members
    pub world_size: usize,
    /// Bound on the whole handshake
    pub timeout: Duration,
}

impl Rendezvous {
    /// `host:port` of the hub
    pub fn address(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    fn error(&self, reason: impl Into<String>) -> DistError {
        DistError::Rendezvous {
            address: self.address(),
            reason: reason.into(),
        }
    }

    /// Socket address to connect to; unspecified hosts map to loopback
    fn connect_addr(&self) -> Result<SocketAddr> {
        let mut addr = (self.master_addr.as_str(), self.master_port)
            .to_socket_addrs()
            .map_err(|e| self.error(format!("cannot resolve host: {}", e)))?
            .next()
            .ok_or_else(|| self.error("host resolved to no address"))?;

        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        Ok(addr)
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

#[derive(Debug)]
enum Role {
    /// Streams to ranks 1..world_size, in rank order
    Hub { peers: Vec<TcpStream> },
    Leaf { hub: TcpStream },
    Closed,
}

/// Star-topology transport over TCP.
///
/// The hub reduces contributions in rank order, so every member observes the
/// same result bit for bit.
#[derive(Debug)]
pub struct StarTransport {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl StarTransport {
    /// Run the rendezvous; blocks until every member has joined or the timeout passes
    pub fn connect(rendezvous: &Rendezvous) -> Result<Self> {
        if rendezvous.world_size < 2 {
            return Err(DistError::InvalidConfig(
                "star transport needs world_size >= 2".into(),
            ));
        }
        if rendezvous.rank >= rendezvous.world_size {
            return Err(DistError::InvalidConfig(format!(
                "rank {} must be < world_size {}",
                rendezvous.rank, rendezvous.world_size
            )));
        }

        let role = if rendezvous.rank == 0 {
            Role::Hub {
                peers: accept_peers(rendezvous)?,
            }
        } else {
            Role::Leaf {
                hub: join_hub(rendezvous)?,
            }
        };

        info!(
            rank = rendezvous.rank,
            world_size = rendezvous.world_size,
            address = %rendezvous.address(),
            "Rendezvous complete"
        );

        Ok(Self {
            rank: rendezvous.rank,
            world_size: rendezvous.world_size,
            role,
        })
    }

    fn closed() -> DistError {
        DistError::Comm("transport is shut down".into())
    }
}

fn accept_peers(rv: &Rendezvous) -> Result<Vec<TcpStream>> {
    let deadline = Instant::now() + rv.timeout;
    let listener = TcpListener::bind((rv.master_addr.as_str(), rv.master_port))
        .map_err(|e| rv.error(format!("bind failed: {}", e)))?;
    listener.set_nonblocking(true)?;

    let expected = rv.world_size - 1;
    let mut slots: Vec<Option<TcpStream>> = (0..expected).map(|_| None).collect();
    let mut joined = 0;

    while joined < expected {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                let wait = remaining(deadline)
                    .ok_or_else(|| rv.error("timed out during handshake"))?;
                let hello = match read_hello(&mut stream, wait.min(HELLO_WAIT)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(%peer_addr, error = %e, "Dropping connection without hello");
                        continue;
                    }
                };
                match hello {
                    Frame::Hello { rank, world_size }
                        if world_size == rv.world_size
                            && (1..rv.world_size).contains(&rank)
                            && slots[rank - 1].is_none() =>
                    {
                        debug!(rank, %peer_addr, "Peer joined");
                        slots[rank - 1] = Some(stream);
                        joined += 1;
                    }
                    Frame::Hello { rank, world_size } => {
                        return Err(rv.error(format!(
                            "rejected peer {} claiming rank {} of {}",
                            peer_addr, rank, world_size
                        )));
                    }
                    other => {
                        debug!(
                            %peer_addr,
                            frame = other.kind(),
                            "Dropping connection that opened with another frame"
                        );
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if remaining(deadline).is_none() {
                    return Err(rv.error(format!(
                        "timed out after {:?} with {}/{} peers joined",
                        rv.timeout, joined, expected
                    )));
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(rv.error(format!("accept failed: {}", e))),
        }
    }

    let mut peers: Vec<TcpStream> = slots.into_iter().flatten().collect();
    for peer in &mut peers {
        peer.set_read_timeout(None)?;
        write_frame(peer, &Frame::Ready)?;
    }
    Ok(peers)
}

fn read_hello(stream: &mut TcpStream, wait: Duration) -> Result<Frame> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(wait))?;
    read_frame(stream)
}

fn join_hub(rv: &Rendezvous) -> Result<TcpStream> {
    let deadline = Instant::now() + rv.timeout;
    let addr = rv.connect_addr()?;

    let mut stream = loop {
        let wait = remaining(deadline).ok_or_else(|| rv.error("timed out connecting"))?;
        match TcpStream::connect_timeout(&addr, wait.min(CONNECT_ATTEMPT)) {
            Ok(stream) => break stream,
            Err(e) => {
                if remaining(deadline).map_or(true, |left| left <= CONNECT_RETRY) {
                    return Err(rv.error(format!(
                        "timed out after {:?} connecting: {}",
                        rv.timeout, e
                    )));
                }
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    };
    stream.set_nodelay(true)?;
    write_frame(
        &mut stream,
        &Frame::Hello {
            rank: rv.rank,
            world_size: rv.world_size,
        },
    )?;

    let wait = remaining(deadline).ok_or_else(|| rv.error("timed out waiting for peers"))?;
    stream.set_read_timeout(Some(wait))?;
    match read_frame(&mut stream) {
        Ok(Frame::Ready) => {}
        Ok(other) => return Err(rv.error(format!("expected ready, got {}", other.kind()))),
        Err(e) => return Err(rv.error(format!("waiting for peers: {}", e))),
    }
    stream.set_read_timeout(None)?;
    Ok(stream)
}

/// Send `reply` to every reachable peer, then surface the first failure
fn broadcast_reply(peers: &mut [TcpStream], reply: &Frame, mut failure: Option<String>) -> Result<()> {
    for (idx, peer) in peers.iter_mut().enumerate() {
        if let Err(e) = write_frame(peer, reply) {
            failure.get_or_insert_with(|| format!("rank {} unreachable: {}", idx + 1, e));
        }
    }
    match failure {
        Some(msg) => Err(DistError::Comm(msg)),
        None => Ok(()),
    }
}

impl Transport for StarTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&mut self, data: &mut [f64], op: ReduceOp) -> Result<()> {
        match &mut self.role {
            Role::Hub { peers } => {
                let mut failure: Option<String> = None;
                for (idx, peer) in peers.iter_mut().enumerate() {
                    let rank = idx + 1;
                    match read_frame(peer) {
                        Ok(Frame::Reduce { op: peer_op, data: contribution }) => {
                            if failure.is_some() {
                                continue;
                            }
                            if peer_op != op {
                                failure = Some(format!(
                                    "rank {} reduces with {}, rank 0 with {}",
                                    rank, peer_op, op
                                ));
                            } else if let Err(e) = op.apply(data, &contribution) {
                                failure = Some(format!("rank {}: {}", rank, e));
                            }
                        }
                        Ok(other) => {
                            failure.get_or_insert_with(|| {
                                format!("rank {} sent {} during all_reduce", rank, other.kind())
                            });
                        }
                        Err(e) => {
                            failure.get_or_insert_with(|| format!("rank {}: {}", rank, e));
                        }
                    }
                }

                let reply = match &failure {
                    Some(msg) => Frame::Error(msg.clone()),
                    None => Frame::Reduced(data.to_vec()),
                };
                broadcast_reply(peers, &reply, failure)
            }
            Role::Leaf { hub } => {
                write_frame(
                    hub,
                    &Frame::Reduce {
                        op,
                        data: data.to_vec(),
                    },
                )?;
                match read_frame(hub)? {
                    Frame::Reduced(result) if result.len() == data.len() => {
                        data.copy_from_slice(&result);
                        Ok(())
                    }
                    Frame::Reduced(result) => Err(DistError::ShapeMismatch {
                        expected: vec![data.len()],
                        got: vec![result.len()],
                    }),
                    Frame::Error(msg) => Err(DistError::Comm(msg)),
                    other => Err(DistError::Comm(format!(
                        "expected reduced, got {}",
                        other.kind()
                    ))),
                }
            }
            Role::Closed => Err(Self::closed()),
        }
    }

    fn all_gather(&mut self, local: &Buffer) -> Result<Vec<Buffer>> {
        match &mut self.role {
            Role::Hub { peers } => {
                let mut gathered = Vec::with_capacity(peers.len() + 1);
                gathered.push(local.clone());
                let mut failure: Option<String> = None;

                for (idx, peer) in peers.iter_mut().enumerate() {
                    match read_frame(peer) {
                        Ok(Frame::Gather(buffer)) => gathered.push(buffer),
                        Ok(other) => {
                            failure.get_or_insert_with(|| {
                                format!("rank {} sent {} during all_gather", idx + 1, other.kind())
                            });
                        }
                        Err(e) => {
                            failure.get_or_insert_with(|| format!("rank {}: {}", idx + 1, e));
                        }
                    }
                }

                let reply = match &failure {
                    Some(msg) => Frame::Error(msg.clone()),
                    None => Frame::Gathered(gathered.clone()),
                };
                broadcast_reply(peers, &reply, failure)?;
                Ok(gathered)
            }
            Role::Leaf { hub } => {
                write_frame(hub, &Frame::Gather(local.clone()))?;
                match read_frame(hub)? {
                    Frame::Gathered(buffers) => Ok(buffers),
                    Frame::Error(msg) => Err(DistError::Comm(msg)),
                    other => Err(DistError::Comm(format!(
                        "expected gathered, got {}",
                        other.kind()
                    ))),
                }
            }
            Role::Closed => Err(Self::closed()),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Role::Leaf { hub } = &mut self.role {
            // The hub may already be gone.
            let _ = write_frame(hub, &Frame::Bye);
        }
        self.role = Role::Closed;
        debug!(rank = self.rank, "Transport shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn rendezvous(port: u16, rank: usize, world_size: usize) -> Rendezvous {
        Rendezvous {
            master_addr: "127.0.0.1".into(),
            master_port: port,
            rank,
            world_size,
            timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_star_all_reduce_and_gather() {
        let port = free_port();
        let world_size = 3;

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                thread::spawn(move || {
                    let mut t = StarTransport::connect(&rendezvous(port, rank, world_size)).unwrap();

                    let mut data = vec![rank as f64 + 1.0, 10.0];
                    t.all_reduce(&mut data, ReduceOp::Sum).unwrap();
                    assert_eq!(data, vec![6.0, 30.0]);

                    let mut data = vec![rank as f64];
                    t.all_reduce(&mut data, ReduceOp::Max).unwrap();
                    assert_eq!(data, vec![2.0]);

                    let gathered = t.all_gather(&Buffer::scalar(rank as f64 * 2.0)).unwrap();
                    let values: Vec<f64> = gathered.iter().map(|b| b.data()[0]).collect();
                    assert_eq!(values, vec![0.0, 2.0, 4.0]);

                    t.shutdown().unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_mismatched_lengths_fail_everywhere() {
        let port = free_port();

        let handles: Vec<_> = (0..2)
            .map(|rank| {
                thread::spawn(move || {
                    let mut t = StarTransport::connect(&rendezvous(port, rank, 2)).unwrap();
                    let mut data = vec![1.0; rank + 1];
                    t.all_reduce(&mut data, ReduceOp::Sum).is_err()
                })
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn test_leaf_times_out_without_hub() {
        let mut rv = rendezvous(free_port(), 1, 2);
        rv.timeout = Duration::from_millis(200);

        let err = StarTransport::connect(&rv).unwrap_err();
        assert!(matches!(err, DistError::Rendezvous { .. }));
    }

    #[test]
    fn test_hub_times_out_without_peers() {
        let mut rv = rendezvous(free_port(), 0, 2);
        rv.timeout = Duration::from_millis(200);

        let err = StarTransport::connect(&rv).unwrap_err();
        assert!(matches!(err, DistError::Rendezvous { .. }));
    }

    fn connect_stray(port: u16) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(_) if Instant::now() < deadline => thread::sleep(CONNECT_RETRY),
                Err(e) => panic!("hub never came up: {}", e),
            }
        }
    }

    #[test]
    fn test_hub_skips_stray_connections() {
        let port = free_port();
        let hub = thread::spawn(move || {
            let mut t = StarTransport::connect(&rendezvous(port, 0, 2)).unwrap();
            let mut data = vec![1.0];
            t.all_reduce(&mut data, ReduceOp::Sum).unwrap();
            t.shutdown().unwrap();
            data
        });

        // closes before saying anything
        drop(connect_stray(port));
        // opens with a frame other than hello
        let mut wrong = connect_stray(port);
        write_frame(&mut wrong, &Frame::Ready).unwrap();
        drop(wrong);

        let mut leaf = StarTransport::connect(&rendezvous(port, 1, 2)).unwrap();
        let mut data = vec![2.0];
        leaf.all_reduce(&mut data, ReduceOp::Sum).unwrap();
        leaf.shutdown().unwrap();

        assert_eq!(data, vec![3.0]);
        assert_eq!(hub.join().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_hub_rejects_rank_claim_out_of_range() {
        let port = free_port();
        let hub = thread::spawn(move || StarTransport::connect(&rendezvous(port, 0, 2)));

        let mut liar = connect_stray(port);
        write_frame(&mut liar, &Frame::Hello { rank: 5, world_size: 2 }).unwrap();

        let err = hub.join().unwrap().unwrap_err();
        assert!(matches!(err, DistError::Rendezvous { .. }));
    }

    #[test]
    fn test_closed_transport() {
        let mut t = StarTransport {
            rank: 1,
            world_size: 2,
            role: Role::Closed,
        };
        assert!(t.all_reduce(&mut [1.0], ReduceOp::Sum).is_err());
        assert!(t.shutdown().is_ok());
    }
}
