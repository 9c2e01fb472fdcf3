// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Keepalive state machine for the push session.
//
// Pure and transport-free: every method takes the current `Instant`, so the
// ping/pong/backoff rules can be tested without sockets or real time.
//
//   Disconnected ──begin_connect──► Connecting ──on_connected──► Connected
//        ▲                                                        │  ▲
//        │ missed pong / transport error               ping sent  │  │ pong
//        └──────────────────────────────────────── AwaitingPong ◄─┘  │
//                                                       └────────────┘

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use cloudspool_core::ConnectorConfig;

/// Timing parameters for keepalive and reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// How long to wait for a pong before declaring the session dead.
    pub ping_timeout: Duration,
    /// Ping interval after a clean (re)connect; also the growth ceiling.
    pub interval_default: Duration,
    /// Floor the interval shrinks to after missed pongs.
    pub interval_min: Duration,
    /// First reconnect delay.
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
}

impl KeepaliveConfig {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            ping_timeout: Duration::from_secs(config.push_ping_timeout_secs),
            interval_default: Duration::from_secs(config.push_ping_interval_default_secs),
            interval_min: Duration::from_secs(config.push_ping_interval_min_secs),
            backoff_initial: Duration::from_millis(config.push_reconnect_backoff_initial_ms),
            backoff_max: Duration::from_secs(config.push_reconnect_backoff_max_secs),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::from_config(&ConnectorConfig::default())
    }
}

/// Liveness of the push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected {
        /// When the last ping exchange finished (or the connection came up).
        last_ping_at: Instant,
        next_ping_interval: Duration,
    },
    AwaitingPong {
        ping_id: String,
        deadline: Instant,
        next_ping_interval: Duration,
    },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::AwaitingPong { .. })
    }

    /// Short label for logs and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::AwaitingPong { .. } => "awaiting-pong",
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No pong before the deadline.
    MissedPong,
    /// Socket closed, I/O error, or failed handshake.
    Transport,
    /// Local shutdown request.
    Shutdown,
}

/// Drives [`SessionState`] through connects, pings, pongs, and reconnects.
#[derive(Debug)]
pub struct KeepaliveMachine {
    config: KeepaliveConfig,
    state: SessionState,
    interval: Duration,
    /// Whether the last disconnect was anything other than a missed pong.
    clean: bool,
    reconnect_attempts: u32,
    connects: u64,
}

impl KeepaliveMachine {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            interval: config.interval_default,
            clean: true,
            reconnect_attempts: 0,
            connects: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Interval the next ping will be scheduled with.
    pub fn ping_interval(&self) -> Duration {
        self.interval
    }

    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// The transport is up and authenticated. Returns `true` when this is a
    /// reconnect, i.e. notifications may have been missed.
    pub fn on_connected(&mut self, now: Instant) -> bool {
        if self.clean {
            self.interval = self.config.interval_default;
        }
        self.clean = true;
        self.reconnect_attempts = 0;
        self.connects += 1;
        self.state = SessionState::Connected {
            last_ping_at: now,
            next_ping_interval: self.interval,
        };
        self.connects > 1
    }

    /// When the driver next needs to call [`on_tick`](Self::on_tick).
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        match &self.state {
            SessionState::Connected {
                last_ping_at,
                next_ping_interval,
            } => *last_ping_at + *next_ping_interval,
            SessionState::AwaitingPong { deadline, .. } => *deadline,
            _ => now + self.config.interval_default,
        }
    }

    pub fn ping_due(&self, now: Instant) -> bool {
        match &self.state {
            SessionState::Connected {
                last_ping_at,
                next_ping_interval,
            } => now >= *last_ping_at + *next_ping_interval,
            _ => false,
        }
    }

    pub fn on_ping_sent(&mut self, ping_id: String, now: Instant) {
        if let SessionState::Connected {
            next_ping_interval, ..
        } = self.state
        {
            self.state = SessionState::AwaitingPong {
                ping_id,
                deadline: now + self.config.ping_timeout,
                next_ping_interval,
            };
        }
    }

    /// Handle a pong. Returns `false` for a pong that matches no pending ping.
    pub fn on_pong(&mut self, pong_id: &str, now: Instant) -> bool {
        let matches = matches!(
            &self.state,
            SessionState::AwaitingPong { ping_id, deadline, .. }
                if ping_id == pong_id && now < *deadline
        );
        if !matches {
            debug!(pong_id, "ignoring unexpected pong");
            return false;
        }

        self.interval = (self.interval * 2).min(self.config.interval_default);
        self.state = SessionState::Connected {
            last_ping_at: now,
            next_ping_interval: self.interval,
        };
        true
    }

    /// Check the pong deadline. A miss moves to `Disconnected`.
    pub fn on_tick(&mut self, now: Instant) -> Option<DisconnectReason> {
        if let SessionState::AwaitingPong { deadline, .. } = &self.state
            && now >= *deadline
        {
            warn!(
                interval_secs = self.interval.as_secs(),
                "pong not received before deadline"
            );
            self.disconnect(DisconnectReason::MissedPong);
            return Some(DisconnectReason::MissedPong);
        }
        None
    }

    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if reason == DisconnectReason::MissedPong {
            self.interval = (self.interval / 2).max(self.config.interval_min);
            self.clean = false;
        } else {
            self.clean = true;
        }
        self.state = SessionState::Disconnected;
    }

    /// Delay before the next connection attempt; doubles up to the cap.
    pub fn next_reconnect_delay(&mut self) -> Duration {
        let factor = 1u32 << self.reconnect_attempts.min(16);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.config
            .backoff_initial
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }
}
