//! Host wire protocol
//!
//! Daemons and clients speak a newline-terminated, shell-quoted command
//! protocol on the host port:
//!
//! ```text
//! client
//! instance <addr> <inport> <outport> <pid> <token>
//! ACK | BAD
//! fail_host <ip:port>
//! transfer_fail <id> | transfer_golive <id> | transfer_complete <id>
//! ```
//!
//! The coordinator answers with configurations, each terminated by the line
//! `end of line`. Anything malformed kills the connection.

use crate::common::{normalize_address, parse_host_port, AuditEventType, Error, Result, TOKEN_LEN};
use crate::coordinator::distribution::frame;
use crate::coordinator::metadata::{InstanceBindings, TransferId};
use crate::coordinator::state::Coordinator;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Client,
    Instance {
        addr: String,
        inport: u16,
        outport: u16,
        pid: u32,
        token: String,
    },
    Ack,
    Bad,
    FailHost { ip: String, port: u16 },
    TransferFail(TransferId),
    TransferGoLive(TransferId),
    TransferComplete(TransferId),
}

fn xferid(raw: &str, verb: &str) -> Result<TransferId> {
    raw.parse()
        .map_err(|_| Error::kill(format!("host uses non-numeric transfer id for {}", verb)))
}

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let words = shlex::split(line)
            .ok_or_else(|| Error::kill(format!("unparseable command {:?}", line)))?;
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["client"] => Ok(HostCommand::Client),
            ["instance", addr, inport, outport, pid, token] => {
                let addr = normalize_address(addr).ok_or_else(|| {
                    Error::kill("instance claims to bind to unparseable address")
                })?;
                let inport = inport.parse().map_err(|_| {
                    Error::kill("instance claims to bind to non-numeric incoming port")
                })?;
                let outport = outport.parse().map_err(|_| {
                    Error::kill("instance claims to bind to non-numeric outgoing port")
                })?;
                let pid = pid
                    .parse()
                    .map_err(|_| Error::kill("instance claims to have non-numeric PID"))?;
                if token.len() != TOKEN_LEN {
                    return Err(Error::kill("instance uses token of improper length"));
                }
                Ok(HostCommand::Instance {
                    addr,
                    inport,
                    outport,
                    pid,
                    token: token.to_string(),
                })
            }
            ["ACK"] => Ok(HostCommand::Ack),
            ["BAD"] => Ok(HostCommand::Bad),
            ["fail_host", host] => {
                let (ip, port) = parse_host_port(host)
                    .ok_or_else(|| Error::kill("host reports failure of invalid address"))?;
                Ok(HostCommand::FailHost { ip, port })
            }
            ["transfer_fail", id] => Ok(HostCommand::TransferFail(xferid(id, "transfer_fail")?)),
            ["transfer_golive", id] => {
                Ok(HostCommand::TransferGoLive(xferid(id, "transfer_golive")?))
            }
            ["transfer_complete", id] => Ok(HostCommand::TransferComplete(xferid(
                id,
                "transfer_complete",
            )?)),
            _ => Err(Error::kill(format!("unrecognized command {:?}", line))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unidentified,
    Client,
    Instance(InstanceBindings),
}

/// Something a host did that belongs in the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub event: AuditEventType,
    pub target: String,
}

/// Per-connection state of a host session.
#[derive(Debug)]
pub struct HostSession {
    peer: SocketAddr,
    role: Role,
    /// Version sent and not yet answered with ACK/BAD.
    pending: Option<u64>,
    last_sent: u64,
}

impl HostSession {
    pub fn new(peer: SocketAddr) -> Self {
        tracing::info!("new host uses ID Unidentified({})", peer);
        Self {
            peer,
            role: Role::Unidentified,
            pending: None,
            last_sent: 0,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Name used in logs.
    pub fn id(&self) -> String {
        match &self.role {
            Role::Unidentified => format!("Unidentified({})", self.peer),
            Role::Client => format!("Client({})", self.peer),
            Role::Instance(bindings) => bindings.to_string(),
        }
    }

    /// Apply one command line to the coordinator.
    pub fn handle_line(&mut self, coord: &mut Coordinator, line: &str) -> Result<Option<HostEvent>> {
        match HostCommand::parse(line)? {
            HostCommand::Client => {
                self.ensure_unidentified("client")?;
                let old = self.id();
                self.role = Role::Client;
                tracing::info!("{} identified by {}", old, self.id());
                Ok(None)
            }
            HostCommand::Instance {
                addr,
                inport,
                outport,
                pid,
                token,
            } => {
                self.ensure_unidentified("instance")?;
                let bindings = coord.register_instance(&addr, inport, outport, pid, &token)?;
                let old = self.id();
                self.role = Role::Instance(bindings.clone());
                tracing::info!("{} identified by {}", old, self.id());
                Ok(Some(HostEvent {
                    event: AuditEventType::InstanceRegistered,
                    target: bindings.to_string(),
                }))
            }
            HostCommand::Ack => {
                if let Role::Instance(bindings) = &self.role {
                    let version = self.outstanding("ACK")?;
                    coord.ack_config(bindings, version)?;
                    tracing::debug!("{} acked config {}", self.id(), version);
                } else if self.role == Role::Unidentified {
                    return Err(Error::kill("ACK before identifying"));
                }
                self.pending = None;
                Ok(None)
            }
            HostCommand::Bad => {
                if let Role::Instance(bindings) = &self.role {
                    let version = self.outstanding("BAD")?;
                    coord.reject_config(bindings, version)?;
                    tracing::error!("{} rejected config {} (there is a bug!)", self.id(), version);
                } else if self.role == Role::Unidentified {
                    return Err(Error::kill("BAD before identifying"));
                }
                self.pending = None;
                Ok(None)
            }
            HostCommand::FailHost { ip, port } => {
                tracing::warn!("{} reports failure of {}:{}", self.id(), ip, port);
                coord.fail_host(&ip, port);
                Ok(Some(HostEvent {
                    event: AuditEventType::HostFailed,
                    target: format!("{}:{}", ip, port),
                }))
            }
            HostCommand::TransferFail(id) => {
                tracing::info!("transfer fail {}", id);
                coord.transfer_fail(id)?;
                Ok(None)
            }
            HostCommand::TransferGoLive(id) => {
                tracing::debug!("transfer golive {}", id);
                coord.transfer_golive(id)?;
                Ok(None)
            }
            HostCommand::TransferComplete(id) => {
                tracing::debug!("transfer complete {}", id);
                coord.transfer_complete(id)?;
                Ok(None)
            }
        }
    }

    fn ensure_unidentified(&self, what: &str) -> Result<()> {
        if self.role != Role::Unidentified {
            return Err(Error::kill(format!("{} identifying twice", what)));
        }
        Ok(())
    }

    fn outstanding(&self, verb: &str) -> Result<u64> {
        self.pending
            .ok_or_else(|| Error::kill(format!("{} without an outstanding configuration", verb)))
    }

    /// The next framed configuration to write, if this session should get
    /// one now. Instances receive one configuration at a time and must answer
    /// it before the next; clients simply get the newest version they have
    /// not seen.
    pub fn next_outgoing(&mut self, coord: &Coordinator) -> Option<String> {
        let config = match &self.role {
            Role::Unidentified => return None,
            Role::Client => coord
                .fetch_config(None)
                .filter(|c| c.version > self.last_sent)?,
            Role::Instance(bindings) => {
                if self.pending.is_some() {
                    return None;
                }
                coord.fetch_config(Some(bindings))?
            }
        };
        self.pending = Some(config.version);
        self.last_sent = config.version;
        Some(frame(&config.blob))
    }
}
