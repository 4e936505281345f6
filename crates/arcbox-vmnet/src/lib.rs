//! # arcbox-vmnet
//!
//! Virtual network interfaces for VMs on macOS, backed by vmnet.framework.
//!
//! This crate provides:
//!
//! - **Interface lifecycle**: start host-only, shared (NAT) or bridged
//!   interfaces and read back their MAC address, MTU and packet size limit
//! - **Packet I/O**: non-blocking single-packet reads and writes, plus a
//!   blocking read driven by host events
//! - **Event bridging**: packets-available notifications coalesced into a
//!   wakeup any thread can wait on
//! - **Port forwarding**: add, remove and list NAT forwarding rules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  arcbox-vmnet                   │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐    │
//! │  │Interface │ │ Packet   │ │ Port Forward │    │
//! │  │lifecycle │ │   I/O    │ │    rules     │    │
//! │  └──────────┘ └──────────┘ └──────────────┘    │
//! │  ┌──────────────────┐ ┌───────────────────┐    │
//! │  │ await_once       │ │ EventBridge       │    │
//! │  │ (completions)    │ │ (packet wakeups)  │    │
//! │  └──────────────────┘ └───────────────────┘    │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │ HostService: vmnet.framework | simulated │   │
//! │  └─────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Every host command that vmnet completes asynchronously is exposed as a
//! blocking call. Blocking calls park the current thread only; async callers
//! should run them on a blocking-capable thread.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod interface;
pub mod packet;
pub mod rules;
pub mod sim;

#[cfg(target_os = "macos")]
pub mod darwin;

pub use completion::{Completer, await_once};
pub use config::VmnetSettings;
pub use error::{ErrorKind, Result, VmnetError, classify};
pub use event::EventBridge;
pub use host::{Capability, HostService, NativeInterface};
pub use interface::{
    Interface, InterfaceConfig, Ipv4Config, Mode, format_mac, list_bridge_eligible_interfaces,
    parse_mac,
};
pub use packet::ReadOutcome;
pub use rules::{Proto, Rule};
pub use sim::SimulatedHost;
