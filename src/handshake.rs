use bytes::BufMut;
use crate::control_messages::ControlMessage;
use crate::packet_header::COMMAND_HEADER_LEN;

/// Embeds the application's shared key into `ConnectRequest` packets, and checks it on the
///  receiving side. This keeps peers of different applications (or different protocol versions
///  if the key is versioned) from talking to each other. It does not protect against an
///  attacker who knows the key.
pub struct ConnectKeyValidator {
    key: Vec<u8>,
}

impl ConnectKeyValidator {
    pub fn new(key: &[u8]) -> ConnectKeyValidator {
        ConnectKeyValidator { key: key.to_vec() }
    }

    pub fn request_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.key.len()
    }

    pub fn write_connect_request(&self, buf: &mut impl BufMut) {
        ControlMessage::ConnectRequest.ser(buf);
        buf.put_slice(&self.key);
    }

    /// Checks the key in a complete `ConnectRequest` packet. The framing bytes (type and
    ///  command) are skipped, not checked.
    pub fn validate(&self, packet: &[u8]) -> bool {
        packet.len() == self.request_len()
            && packet[COMMAND_HEADER_LEN..] == self.key[..]
    }
}
