use std::net::{Ipv4Addr, TcpListener};

use crate::error::{Result, ServerError};

/// Ask the OS for a free loopback port by binding to port 0.
///
/// The socket is released on return, so the caller must hand the port to
/// the server promptly.
pub fn find_available_port() -> Result<u16> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(ServerError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(ServerError::PortAllocation)?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_is_nonzero_and_bindable() {
        let port = find_available_port().unwrap();
        assert_ne!(port, 0);
        // Released on return, so binding again works
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}
