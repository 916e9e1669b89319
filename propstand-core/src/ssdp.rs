//! SSDP discovery datagram
//!
//! Devices sit passively on the LAN until they hear an SSDP search for the
//! test stand URN; they then open a TCP connection back to the datagram's
//! source address. The server only ever transmits - replies are not parsed.

/// SSDP multicast group
pub const MULTICAST_ADDR: &str = "239.255.255.250";
pub const MULTICAST_PORT: u16 = 1900;

/// Search target the devices answer to
pub const SEARCH_TARGET: &str = "urn:qretprop:espdevice:1";

pub const USER_AGENT: &str = "QRET/1.0";

/// Build the M-SEARCH datagram.
pub fn m_search() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {}\r\n\
         USER-AGENT: {}\r\n\
         \r\n",
        MULTICAST_ADDR, MULTICAST_PORT, SEARCH_TARGET, USER_AGENT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_m_search_datagram() {
        assert_eq!(
            m_search(),
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: urn:qretprop:espdevice:1\r\n\
             USER-AGENT: QRET/1.0\r\n\
             \r\n"
        );
    }
}
