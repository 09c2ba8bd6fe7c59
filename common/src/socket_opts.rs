use std::{io, net::TcpStream};

/// Enable or disable `SO_KEEPALIVE` on a connected TCP stream.
pub fn set_keepalive(stream: &TcpStream, enabled: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::socket::{setsockopt, sockopt::KeepAlive};

        setsockopt(stream, KeepAlive, &enabled).map_err(io::Error::from)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawSocket;

        use windows::Win32::Networking::WinSock::{
            setsockopt, WSAGetLastError, SOCKET, SOCKET_ERROR, SOL_SOCKET, SO_KEEPALIVE,
        };

        let value = i32::from(enabled).to_ne_bytes();
        // SAFETY: the socket handle is owned by `stream` and stays open for
        // the duration of the call; `value` outlives it.
        let result = unsafe {
            setsockopt(
                SOCKET(stream.as_raw_socket() as usize),
                SOL_SOCKET,
                SO_KEEPALIVE,
                Some(&value),
            )
        };
        if result == SOCKET_ERROR {
            // SAFETY: WSAGetLastError only reads thread-local state
            let code = unsafe { WSAGetLastError() };
            return Err(io::Error::from_raw_os_error(code.0));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, enabled);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP keepalive is not supported on this platform",
        ))
    }
}

/// Read back `SO_KEEPALIVE` from a connected TCP stream.
pub fn keepalive(stream: &TcpStream) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use nix::sys::socket::{getsockopt, sockopt::KeepAlive};

        getsockopt(stream, KeepAlive).map_err(io::Error::from)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawSocket;

        use windows::{
            core::PSTR,
            Win32::Networking::WinSock::{
                getsockopt, WSAGetLastError, SOCKET, SOCKET_ERROR, SOL_SOCKET, SO_KEEPALIVE,
            },
        };

        let mut value = [0u8; 4];
        let mut len = value.len() as i32;
        // SAFETY: `value` and `len` describe a valid 4 byte buffer that lives
        // across the call, and the socket handle is owned by `stream`.
        let result = unsafe {
            getsockopt(
                SOCKET(stream.as_raw_socket() as usize),
                SOL_SOCKET,
                SO_KEEPALIVE,
                PSTR(value.as_mut_ptr()),
                &mut len,
            )
        };
        if result == SOCKET_ERROR {
            // SAFETY: WSAGetLastError only reads thread-local state
            let code = unsafe { WSAGetLastError() };
            return Err(io::Error::from_raw_os_error(code.0));
        }
        Ok(i32::from_ne_bytes(value) != 0)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = stream;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP keepalive is not supported on this platform",
        ))
    }
}
