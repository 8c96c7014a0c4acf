//! OSC (Open Sound Control) target for an external synthesizer.
//!
//! A target is either bound to a UDP address or unbound. Sending to an
//! unbound target succeeds and does nothing, so an engine without an
//! external synth never sees relay errors.

use crate::error::Result;
use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::net::UdpSocket;
use std::sync::Arc;

#[derive(Clone)]
pub struct OscTarget {
    /// The underlying UDP socket (None when unbound).
    sock: Option<Arc<UdpSocket>>,
    /// Target address in "host:port" format.
    pub addr: String,
}

impl OscTarget {
    /// Create a target sending to `addr` ("host:port") from an ephemeral port.
    pub fn bind<A: Into<String>>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            sock: Some(Arc::new(sock)),
            addr: addr.into(),
        })
    }

    /// A target that silently discards everything.
    pub fn unbound() -> Self {
        Self {
            sock: None,
            addr: "unbound".to_string(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.sock.is_some()
    }

    /// Create an OSC message packet (for use in bundles).
    pub fn msg(path: &str, args: Vec<OscType>) -> OscPacket {
        OscPacket::Message(OscMessage {
            addr: path.into(),
            args,
        })
    }

    /// Wrap packets in a bundle scheduled at `timetag`.
    pub fn bundle(timetag: OscTime, packets: Vec<OscPacket>) -> OscPacket {
        OscPacket::Bundle(OscBundle {
            timetag,
            content: packets,
        })
    }

    pub fn send_packet(&self, packet: &OscPacket) -> Result<()> {
        let sock = match &self.sock {
            Some(s) => s,
            None => return Ok(()),
        };
        let buf = encoder::encode(packet)?;
        sock.send_to(&buf, &self.addr)?;
        Ok(())
    }

    /// Send packets in a bundle scheduled at `timetag`.
    pub fn send_bundle(&self, timetag: OscTime, packets: Vec<OscPacket>) -> Result<()> {
        if self.sock.is_none() {
            return Ok(());
        }
        self.send_packet(&Self::bundle(timetag, packets))
    }
}

impl std::fmt::Debug for OscTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscTarget")
            .field("addr", &self.addr)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unbound_target_is_silent() {
        let target = OscTarget::unbound();
        assert!(!target.is_bound());
        let packet = OscTarget::msg("/dirt/play", vec![OscType::Float(1.0)]);
        assert!(target.send_packet(&packet).is_ok());
        assert!(target
            .send_bundle(OscTime::from((1, 0)), vec![packet])
            .is_ok());
    }

    #[test]
    fn test_bundle_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let target = OscTarget::bind(addr).unwrap();
        let msg = OscTarget::msg(
            "/dirt/play",
            vec![OscType::String("s".to_string()), OscType::String("bd".to_string())],
        );
        target
            .send_bundle(OscTime::from((100, 5)), vec![msg])
            .unwrap();

        let mut buf = [0u8; 1024];
        let (size, _) = listener.recv_from(&mut buf).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
        match packet {
            OscPacket::Bundle(bundle) => {
                assert_eq!(bundle.timetag, OscTime::from((100, 5)));
                assert_eq!(bundle.content.len(), 1);
            }
            other => panic!("expected bundle, got {:?}", other),
        }
    }
}
