//! Connection lifecycle states and identity.

use std::fmt;

use serde::Serialize;

use crate::transport::SecurityFactors;

/// Slot-level state in the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StructState {
    /// Never used since the table was created.
    Uninitialized,
    /// Free for a new connection.
    Unused,
    Used,
}

/// Protocol-level state of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    /// The connection has been freed; any handle to it is stale.
    Invalid,
    /// Accepted, no request admitted yet.
    Inactive,
    Active,
    /// A bind is in progress; other requests wait.
    Binding,
    /// Tearing down; waits for outstanding operations before release.
    Closing,
    /// Driven by an in-process client; admission is bypassed.
    Client,
}

impl ConnState {
    pub fn name(self) -> &'static str {
        match self {
            ConnState::Invalid => "invalid",
            ConnState::Inactive => "inactive",
            ConnState::Active => "active",
            ConnState::Binding => "binding",
            ConnState::Closing => "closing",
            ConnState::Client => "client",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Authentication state of a connection, snapshotted into operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthInfo {
    /// Bound DN; empty for anonymous.
    pub dn: String,
    pub mechanism: String,
    pub version: u32,
    pub ssf: SecurityFactors,
}

impl AuthInfo {
    /// Identity after a successful simple bind.
    pub fn simple(dn: impl Into<String>, version: u32) -> Self {
        Self { dn: dn.into(), mechanism: "SIMPLE".to_string(), version, ssf: SecurityFactors::default() }
    }

    pub fn is_anonymous(&self) -> bool {
        self.dn.is_empty()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.is_anonymous()
    }

    /// Forget the bound identity, keeping protocol version and transport
    /// security.
    pub fn reset_identity(&mut self) {
        self.dn.clear();
        self.mechanism.clear();
    }

    pub fn clear(&mut self) {
        self.reset_identity();
        self.version = 0;
        self.ssf = SecurityFactors::default();
    }
}
