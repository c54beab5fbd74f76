//! Address-family / socket-type / protocol enumerations and name resolution.
//!
//! The numeric values match the Winsock constants of the same name one for
//! one (this is what let the original socket layer cast its enums straight
//! into the `WSASocket`/`getaddrinfo` calls); we keep the same values here so
//! a caller porting code from the original needs no translation table.

use crate::error::Error;
use std::ffi::CString;
use windows::core::PCSTR;
use windows::Win32::Networking::WinSock::{
    self, ADDRESS_FAMILY, ADDRINFOA, AF_INET, AF_INET6, AF_UNIX, AF_UNSPEC, IPPROTO_ICMP,
    IPPROTO_IDP, IPPROTO_IGMP, IPPROTO_IP, IPPROTO_PUP, IPPROTO_RAW, IPPROTO_TCP, IPPROTO_UDP,
    SOCK_DGRAM, SOCK_RAW, SOCK_RDM, SOCK_SEQPACKET, SOCK_STREAM,
};

/// Address family of a socket's endpoint. Values match the corresponding
/// `AF_*` Winsock constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AddressFamily {
    Unspecified = 0,
    LocalToHost = 1,
    InternetworkV4 = 2,
    InternetworkV6 = 23,
}

impl AddressFamily {
    pub(crate) fn to_winsock(self) -> ADDRESS_FAMILY {
        match self {
            Self::Unspecified => AF_UNSPEC,
            Self::LocalToHost => AF_UNIX,
            Self::InternetworkV4 => AF_INET,
            Self::InternetworkV6 => AF_INET6,
        }
    }
}

/// Socket communication semantics. Values match the corresponding `SOCK_*`
/// Winsock constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SocketType {
    Stream = 1,
    Datagram = 2,
    Raw = 3,
    ReliablyDelivered = 4,
    SequencedPacket = 5,
}

impl SocketType {
    pub(crate) fn to_winsock(self) -> WinSock::WINSOCK_SOCKET_TYPE {
        match self {
            Self::Stream => SOCK_STREAM,
            Self::Datagram => SOCK_DGRAM,
            Self::Raw => SOCK_RAW,
            Self::ReliablyDelivered => SOCK_RDM,
            Self::SequencedPacket => SOCK_SEQPACKET,
        }
    }
}

/// Transport/network protocol. Values match the corresponding `IPPROTO_*`
/// Winsock constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Protocol {
    Ip = 0,
    Icmp = 1,
    Igmp = 2,
    Ggp = 3,
    Tcp = 6,
    Pup = 12,
    Udp = 17,
    Idp = 22,
    UnofficialNetDisk = 77,
    Raw = 255,
}

impl Protocol {
    pub(crate) fn to_winsock(self) -> WinSock::IPPROTO {
        match self {
            Self::Ip => IPPROTO_IP,
            Self::Icmp => IPPROTO_ICMP,
            Self::Igmp => IPPROTO_IGMP,
            // GGP and the unofficial net-disk protocol have no named Winsock
            // constant; pass the raw number through as `AcceptAsync`'s
            // resolver-free paths do.
            Self::Ggp => WinSock::IPPROTO(3),
            Self::Tcp => IPPROTO_TCP,
            Self::Pup => IPPROTO_PUP,
            Self::Udp => IPPROTO_UDP,
            Self::Idp => IPPROTO_IDP,
            Self::UnofficialNetDisk => WinSock::IPPROTO(77),
            Self::Raw => IPPROTO_RAW,
        }
    }
}

/// A resolved `sockaddr` ready to be handed to `bind`/`connect`/`ConnectEx`.
pub(crate) struct ResolvedAddress {
    pub(crate) family: ADDRESS_FAMILY,
    pub(crate) storage: Vec<u8>,
}

impl ResolvedAddress {
    pub(crate) fn as_sockaddr(&self) -> *const WinSock::SOCKADDR {
        self.storage.as_ptr().cast()
    }

    pub(crate) fn len(&self) -> i32 {
        self.storage.len() as i32
    }
}

/// Resolves `host:port` for the given family/type/protocol via
/// `getaddrinfo`, returning the first candidate. `host` of `None` resolves
/// the wildcard address (used by `Bind`).
pub(crate) fn resolve(
    host: Option<&str>,
    port: u16,
    family: AddressFamily,
    socket_type: SocketType,
    protocol: Protocol,
) -> Result<ResolvedAddress, Error> {
    let host_c = host.map(|h| CString::new(h).expect("host contains no interior NUL"));
    let port_c = CString::new(port.to_string()).expect("port string contains no interior NUL");

    let hints = ADDRINFOA {
        ai_family: family.to_winsock().0 as i32,
        ai_socktype: socket_type.to_winsock().0,
        ai_protocol: protocol.to_winsock().0,
        ai_flags: if host.is_none() {
            WinSock::AI_PASSIVE as i32
        } else {
            0
        },
        ..Default::default()
    };

    let mut result: *mut ADDRINFOA = std::ptr::null_mut();
    let host_ptr = match &host_c {
        Some(h) => PCSTR(h.as_ptr() as *const u8),
        None => PCSTR::null(),
    };

    // SAFETY: `hints` is a valid, fully-initialized ADDRINFOA; `result` is an
    // out-param freed below via `FreeAddrInfoA` on the success path.
    let rc = unsafe {
        WinSock::getaddrinfo(
            host_ptr,
            PCSTR(port_c.as_ptr() as *const u8),
            Some(&hints),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(Error::from_raw_os_error(rc));
    }

    // SAFETY: `result` was just populated by a successful `getaddrinfo` call
    // and is non-null; we copy its first entry out before freeing the list.
    let resolved = unsafe {
        let entry = &*result;
        let len = entry.ai_addrlen as usize;
        let bytes = std::slice::from_raw_parts(entry.ai_addr as *const u8, len).to_vec();
        let family = (*entry.ai_addr).sa_family;
        ResolvedAddress {
            family,
            storage: bytes,
        }
    };

    // SAFETY: `result` was allocated by the preceding `getaddrinfo` call.
    unsafe { WinSock::FreeAddrInfoA(Some(result)) };

    Ok(resolved)
}
