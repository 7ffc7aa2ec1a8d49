//! RESP-over-TCP implementation of [`Admin`].

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::admin::{Admin, AdminOptions};
use super::cluster_infos::{ClusterInfos, NodeInfos};
use super::connections::AdminConnections;
use super::node::Node;
use super::resp::{encode_command, read_value, Value};
use super::slot::Slot;
use crate::error::RedisError;

/// One TCP connection speaking RESP2.
pub struct RespConnection {
    addr: String,
    stream: BufReader<TcpStream>,
    command_timeout: Duration,
}

impl RespConnection {
    /// Connect and authenticate.
    pub async fn connect(addr: &str, options: &AdminOptions) -> Result<Self, RedisError> {
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisError::Connection {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| RedisError::Connection {
                addr: addr.to_string(),
                source,
            })?;

        let mut conn = Self {
            addr: addr.to_string(),
            stream: BufReader::new(stream),
            command_timeout: options.command_timeout,
        };
        if let Some(password) = &options.password {
            conn.command(&["AUTH", password.as_str()]).await?;
        }
        Ok(conn)
    }

    /// Send one command and read its reply. Error replies become [`RedisError::Server`].
    pub async fn command<S: AsRef<[u8]>>(&mut self, args: &[S]) -> Result<Value, RedisError> {
        let timeout = self.command_timeout;
        self.command_within(args, timeout).await
    }

    /// Like [`RespConnection::command`] with an explicit deadline.
    ///
    /// After a [`RedisError::breaks_connection`] error the stream is out of step
    /// with the server and the connection must be dropped.
    pub async fn command_within<S: AsRef<[u8]>>(
        &mut self,
        args: &[S],
        timeout: Duration,
    ) -> Result<Value, RedisError> {
        let payload = encode_command(args);
        let round_trip = async {
            self.stream
                .get_mut()
                .write_all(&payload)
                .await
                .map_err(|source| RedisError::Connection {
                    addr: self.addr.clone(),
                    source,
                })?;
            read_value(&mut self.stream).await
        };
        let value = tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| RedisError::Connection {
                addr: self.addr.clone(),
                source: io::Error::new(io::ErrorKind::TimedOut, "command timed out"),
            })??;

        match value {
            Value::Error(message) => Err(RedisError::Server {
                addr: self.addr.clone(),
                message,
            }),
            other => Ok(other),
        }
    }
}

/// [`Admin`] backed by a shared [`AdminConnections`] pool.
pub struct RedisAdmin {
    conns: Arc<AdminConnections<RespConnection>>,
    options: AdminOptions,
}

impl RedisAdmin {
    /// Build an admin over `conns`, connecting to any address of `addrs` not pooled yet.
    ///
    /// Nodes that cannot be reached are logged and skipped; the snapshot will
    /// report them as missing.
    pub async fn connect(
        addrs: &[String],
        conns: Arc<AdminConnections<RespConnection>>,
        options: AdminOptions,
    ) -> Self {
        let admin = Self { conns, options };
        for addr in addrs {
            if let Err(e) = admin.add_node_connection(addr).await {
                warn!(addr = %addr, error = %e, "Cannot connect to redis node");
            }
        }
        admin
    }

    async fn command<S: AsRef<[u8]> + Sync>(
        &self,
        addr: &str,
        args: &[S],
    ) -> Result<Value, RedisError> {
        self.command_within(addr, args, self.options.command_timeout)
            .await
    }

    /// Run one command on the pooled connection to `addr`.
    ///
    /// A connection left out of step by a timeout or a transport error is closed
    /// and unpooled; the next [`Admin::add_node_connection`] opens a fresh one.
    async fn command_within<S: AsRef<[u8]> + Sync>(
        &self,
        addr: &str,
        args: &[S],
        timeout: Duration,
    ) -> Result<Value, RedisError> {
        let handle = self
            .conns
            .get(addr)
            .await
            .ok_or_else(|| RedisError::NoConnection(addr.to_string()))?;
        let result = {
            let mut slot = handle.lock().await;
            let conn = slot
                .as_mut()
                .ok_or_else(|| RedisError::NoConnection(addr.to_string()))?;
            let result = conn.command_within(args, timeout).await;
            if matches!(&result, Err(e) if e.breaks_connection()) {
                slot.take();
            }
            result
        };
        if let Err(e) = &result {
            if e.breaks_connection() {
                warn!(addr = %addr, error = %e, "Dropping broken admin connection");
                self.conns.evict(addr, &handle).await;
            }
        }
        result
    }

    async fn expect_ok<S: AsRef<[u8]> + Sync>(&self, addr: &str, args: &[S]) -> Result<(), RedisError> {
        let reply = self.command(addr, args).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(RedisError::UnexpectedReply {
                addr: addr.to_string(),
                reply: format!("{:?}", reply),
            })
        }
    }

    async fn migrate_slot(&self, source: &Node, target: &Node, slot: Slot) -> Result<(), RedisError> {
        let src = source.ip_port();
        let dst = target.ip_port();
        let slot_arg = slot.to_string();

        self.expect_ok(&dst, &["CLUSTER", "SETSLOT", slot_arg.as_str(), "IMPORTING", source.id.as_str()])
            .await?;
        self.expect_ok(&src, &["CLUSTER", "SETSLOT", slot_arg.as_str(), "MIGRATING", target.id.as_str()])
            .await?;

        let batch = self.options.migrate_batch.to_string();
        let port = target.port.to_string();
        let timeout = self.options.migrate_timeout_millis.to_string();
        // MIGRATE blocks the source for up to its own timeout.
        let migrate_deadline =
            Duration::from_millis(self.options.migrate_timeout_millis) + self.options.command_timeout;
        loop {
            let reply = self
                .command(&src, &["CLUSTER", "GETKEYSINSLOT", slot_arg.as_str(), batch.as_str()])
                .await?;
            let keys: Vec<String> = match reply {
                Value::Array(Some(items)) => items.iter().filter_map(Value::as_text).collect(),
                other => {
                    return Err(RedisError::UnexpectedReply {
                        addr: src.clone(),
                        reply: format!("{:?}", other),
                    })
                }
            };
            if keys.is_empty() {
                break;
            }
            let mut args: Vec<&str> = vec![
                "MIGRATE",
                target.ip.as_str(),
                port.as_str(),
                "",
                "0",
                timeout.as_str(),
                "REPLACE",
            ];
            if let Some(password) = &self.options.password {
                args.extend(["AUTH", password.as_str()]);
            }
            args.push("KEYS");
            args.extend(keys.iter().map(String::as_str));
            self.command_within(&src, &args, migrate_deadline).await?;
        }

        for addr in [&src, &dst] {
            self.expect_ok(addr, &["CLUSTER", "SETSLOT", slot_arg.as_str(), "NODE", target.id.as_str()])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Admin for RedisAdmin {
    async fn cluster_infos(&self) -> Result<ClusterInfos, RedisError> {
        let addrs = self.conns.addresses().await;
        let mut infos = BTreeMap::new();
        let mut unreachable = 0;
        let mut last_error = None;

        for addr in &addrs {
            let reply = self
                .command(addr, &["CLUSTER", "NODES"])
                .await
                .and_then(|v| {
                    v.as_text().ok_or_else(|| RedisError::UnexpectedReply {
                        addr: addr.clone(),
                        reply: format!("{:?}", v),
                    })
                })
                .and_then(|raw| NodeInfos::parse(&raw));
            match reply {
                Ok(node_infos) => {
                    infos.insert(addr.clone(), node_infos);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "CLUSTER NODES failed");
                    unreachable += 1;
                    last_error = Some(e);
                }
            }
        }

        if infos.is_empty() {
            return Err(last_error.unwrap_or_else(|| RedisError::NoConnection("no pooled nodes".to_string())));
        }
        Ok(ClusterInfos::from_views(infos, unreachable))
    }

    async fn attach_node_to_cluster(&self, addr: &str) -> Result<(), RedisError> {
        let (ip, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| RedisError::Protocol(format!("invalid address '{}'", addr)))?;
        let mut last_error = None;
        for peer in self.conns.addresses().await {
            if peer == addr {
                continue;
            }
            if let Err(e) = self.expect_ok(&peer, &["CLUSTER", "MEET", ip, port]).await {
                warn!(peer = %peer, target = %addr, error = %e, "CLUSTER MEET failed");
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn attach_slave_to_master(&self, slave: &Node, master: &Node) -> Result<(), RedisError> {
        if slave.master_ref.as_deref() == Some(master.id.as_str()) {
            debug!(slave = %slave.id, master = %master.id, "Already attached");
            return Ok(());
        }
        info!(slave = %slave.ip_port(), master = %master.ip_port(), "CLUSTER REPLICATE");
        self.expect_ok(&slave.ip_port(), &["CLUSTER", "REPLICATE", master.id.as_str()])
            .await
    }

    async fn add_slots(&self, addr: &str, slots: &[Slot]) -> Result<(), RedisError> {
        for chunk in slots.chunks(1000) {
            let mut args = vec!["CLUSTER".to_string(), "ADDSLOTS".to_string()];
            args.extend(chunk.iter().map(|s| s.to_string()));
            self.expect_ok(addr, &args).await?;
        }
        Ok(())
    }

    async fn migrate_slots(
        &self,
        source: &Node,
        target: &Node,
        slots: &[Slot],
    ) -> Result<(), RedisError> {
        info!(
            from = %source.ip_port(),
            to = %target.ip_port(),
            count = slots.len(),
            "Migrating slots"
        );
        for &slot in slots {
            self.migrate_slot(source, target, slot).await?;
        }
        Ok(())
    }

    async fn forget_node(&self, id: &str) -> Result<(), RedisError> {
        let mut last_error = None;
        for peer in self.conns.addresses().await {
            match self.expect_ok(&peer, &["CLUSTER", "FORGET", id]).await {
                Ok(()) => {}
                // The node itself and its replicas refuse; both go away with the group.
                Err(RedisError::Server { message, .. }) if message.contains("forget my") => {}
                Err(e) => {
                    warn!(peer = %peer, node = %id, error = %e, "CLUSTER FORGET failed");
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn add_node_connection(&self, addr: &str) -> Result<(), RedisError> {
        if self.conns.contains(addr).await {
            return Ok(());
        }
        let conn = RespConnection::connect(addr, &self.options).await?;
        self.conns.add(addr, conn).await;
        Ok(())
    }

    async fn remove_node_connection(&self, addr: &str) {
        if self.conns.remove(addr).await.is_some() {
            debug!(addr = %addr, "Removed admin connection");
        }
    }
}
