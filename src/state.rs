//! Lock-free engine state shared between handles and the driver task
//!
//! The driver is the only writer of the lifecycle value; handles read it to
//! fast-fail operations that require a connected engine.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Connection lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// No socket; commands that need a connection fail or are dropped.
    Disconnected = 0,
    /// Transport is open, upgrade request sent, 101 not yet validated.
    Handshaking = 1,
    /// Upgrade validated; frames flow.
    Connected = 2,
    /// The driver task has exited.
    Terminated = 3,
}

/// Atomic wrapper around [`Lifecycle`].
#[derive(Debug)]
pub struct AtomicLifecycle {
    state: AtomicU8,
}

impl AtomicLifecycle {
    pub fn new(initial: Lifecycle) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> Lifecycle {
        match self.state.load(Ordering::Acquire) {
            0 => Lifecycle::Disconnected,
            1 => Lifecycle::Handshaking,
            2 => Lifecycle::Connected,
            _ => Lifecycle::Terminated,
        }
    }

    pub fn set(&self, state: Lifecycle) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.get() == Lifecycle::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.get() == Lifecycle::Disconnected
    }

    pub fn is_terminated(&self) -> bool {
        self.get() == Lifecycle::Terminated
    }
}

/// Atomic counters kept by the driver, readable from any handle.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    reconnects: AtomicU64,
    pings_sent: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pings(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reconnects: u64,
    pub pings_sent: u64,
    pub lifecycle: Lifecycle,
}
