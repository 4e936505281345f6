//! Port-forwarding rules.
//!
//! The host's NAT layer owns the rule table; nothing is cached here.
//! [`Interface::rules`] always queries the live set. Mutations block until the
//! host acknowledges them. Concurrent mutations on the same interface are not
//! serialized by this crate, so their relative order is whatever the host
//! provides.

use std::fmt;
use std::net::Ipv4Addr;

use crate::completion::await_once;
use crate::error::{Result, VmnetError, check, classify};
use crate::host::{Capability, Status};
use crate::interface::Interface;

/// IANA protocol number for ICMP.
const IPPROTO_ICMP: u8 = 1;
/// IANA protocol number for TCP.
const IPPROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
const IPPROTO_UDP: u8 = 17;

/// IP protocol of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// Any other IANA protocol number.
    Other(u8),
}

impl From<u8> for Proto {
    fn from(number: u8) -> Self {
        match number {
            IPPROTO_ICMP => Self::Icmp,
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            other => Self::Other(other),
        }
    }
}

impl From<Proto> for u8 {
    fn from(proto: Proto) -> Self {
        match proto {
            Proto::Icmp => IPPROTO_ICMP,
            Proto::Tcp => IPPROTO_TCP,
            Proto::Udp => IPPROTO_UDP,
            Proto::Other(number) => number,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::Other(number) => write!(f, "proto-{number}"),
        }
    }
}

/// A port-forwarding rule.
///
/// Keyed by `(proto, external_port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rule {
    /// IP protocol.
    pub proto: Proto,
    /// Port on the host side.
    pub external_port: u16,
    /// Guest address traffic is forwarded to.
    pub internal_address: Ipv4Addr,
    /// Guest port traffic is forwarded to.
    pub internal_port: u16,
}

impl Rule {
    /// Creates a new rule.
    #[must_use]
    pub fn new(
        proto: impl Into<Proto>,
        external_port: u16,
        internal_address: Ipv4Addr,
        internal_port: u16,
    ) -> Self {
        Self {
            proto: proto.into(),
            external_port,
            internal_address,
            internal_port,
        }
    }

    /// Returns the `(proto, external_port)` key.
    #[must_use]
    pub const fn key(&self) -> (Proto, u16) {
        (self.proto, self.external_port)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{}",
            self.proto, self.external_port, self.internal_address, self.internal_port
        )
    }
}

impl Interface {
    fn ensure_port_forwarding(&self) -> Result<()> {
        self.ensure_running()?;
        if self.host.supports(Capability::PortForwarding) {
            Ok(())
        } else {
            Err(VmnetError::ApiNotSupported(Capability::PortForwarding.name()))
        }
    }

    /// Adds a port-forwarding rule and waits for the host to acknowledge it.
    ///
    /// Adding a rule whose key already exists is passed straight to the host;
    /// whether it replaces the old rule or fails is host-defined.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::ApiNotSupported`] on hosts without port
    /// forwarding, or the host status on failure.
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        self.ensure_port_forwarding()?;
        let status: Status = await_once(|done| {
            self.native
                .add_port_forwarding_rule(rule, done)
                .map_err(|code| VmnetError::Native(classify(code)))
        })?;
        check(status)?;

        tracing::debug!(name = %self.name(), %rule, "port forwarding rule added");
        Ok(())
    }

    /// Removes the rule keyed by `(proto, external_port)` and waits for the
    /// host to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::ApiNotSupported`] on hosts without port
    /// forwarding, or the host status on failure.
    pub fn remove_rule(&self, proto: Proto, external_port: u16) -> Result<()> {
        self.ensure_port_forwarding()?;
        let status: Status = await_once(|done| {
            self.native
                .remove_port_forwarding_rule(proto, external_port, done)
                .map_err(|code| VmnetError::Native(classify(code)))
        })?;
        check(status)?;

        tracing::debug!(name = %self.name(), %proto, external_port, "port forwarding rule removed");
        Ok(())
    }

    /// Returns a snapshot of the live rule set.
    ///
    /// The set may change as soon as this returns.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::ApiNotSupported`] on hosts without port
    /// forwarding, or the host status on failure.
    pub fn rules(&self) -> Result<Vec<Rule>> {
        self.ensure_port_forwarding()?;
        self.native
            .port_forwarding_rules()
            .map_err(|code| VmnetError::Native(classify(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::ErrorKind;
    use crate::interface::InterfaceConfig;
    use crate::sim::SimulatedHost;

    const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn iface() -> Interface {
        Interface::create_with(Arc::new(SimulatedHost::new()), InterfaceConfig::shared()).unwrap()
    }

    #[test]
    fn test_proto_numbers() {
        assert_eq!(Proto::from(6), Proto::Tcp);
        assert_eq!(Proto::from(17), Proto::Udp);
        assert_eq!(Proto::from(1), Proto::Icmp);
        assert_eq!(Proto::from(132), Proto::Other(132));

        for number in 0..=u8::MAX {
            assert_eq!(u8::from(Proto::from(number)), number);
        }
    }

    #[test]
    fn test_proto_display() {
        assert_eq!(Proto::Tcp.to_string(), "tcp");
        assert_eq!(Proto::Other(47).to_string(), "proto-47");
    }

    #[test]
    fn test_rule_display_and_key() {
        let rule = Rule::new(Proto::Tcp, 8080, GUEST, 80);
        assert_eq!(rule.to_string(), "tcp 8080 -> 10.0.0.5:80");
        assert_eq!(rule.key(), (Proto::Tcp, 8080));
        assert_eq!(Rule::new(17u8, 53, GUEST, 53).proto, Proto::Udp);
    }

    #[test]
    fn test_add_list_remove_scenario() {
        let iface = iface();
        let tcp = Rule::new(Proto::Tcp, 1234, GUEST, 1234);
        let udp = Rule::new(Proto::Udp, 1234, GUEST, 1234);

        iface.add_rule(tcp).unwrap();
        assert_eq!(iface.rules().unwrap(), vec![tcp]);

        iface.add_rule(udp).unwrap();
        let rules = iface.rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.contains(&tcp));
        assert!(rules.contains(&udp));

        iface.remove_rule(Proto::Udp, 1234).unwrap();
        assert_eq!(iface.rules().unwrap(), vec![tcp]);
    }

    #[test]
    fn test_remove_ignores_internal_endpoint() {
        let iface = iface();
        iface.add_rule(Rule::new(Proto::Tcp, 2222, GUEST, 22)).unwrap();
        iface.remove_rule(Proto::Tcp, 2222).unwrap();
        assert!(iface.rules().unwrap().is_empty());
    }

    #[test]
    fn test_remove_missing_rule_is_native_error() {
        let iface = iface();
        let err = iface.remove_rule(Proto::Tcp, 9).unwrap_err();
        assert!(err.is_native(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_rules_unsupported_on_old_host() {
        let host = SimulatedHost::new().with_capability(Capability::PortForwarding, false);
        let iface = Interface::create_with(Arc::new(host), InterfaceConfig::shared()).unwrap();

        let rule = Rule::new(Proto::Tcp, 80, GUEST, 80);
        assert!(matches!(
            iface.add_rule(rule),
            Err(VmnetError::ApiNotSupported(_))
        ));
        assert!(matches!(
            iface.remove_rule(Proto::Tcp, 80),
            Err(VmnetError::ApiNotSupported(_))
        ));
        assert!(matches!(iface.rules(), Err(VmnetError::ApiNotSupported(_))));
    }
}
