//! DHCPv4 request handling.
//!
//! Replies are built from the lease bound to the client hardware address;
//! requests for unknown MACs are dropped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use dhcproto::{Decodable, Encodable};
use eui48::MacAddress;
use tracing::{debug, info};

use crate::error::DhcpError;
use crate::lease::{DhcpLease, LeaseTable};

/// Server port, also the relay port.
pub const SERVER_PORT: u16 = 67;

/// Client port.
pub const CLIENT_PORT: u16 = 68;

/// Builds the OFFER/ACK for `req`, or `None` when the packet is dropped.
pub fn build_reply(table: &LeaseTable, req: &Message) -> Option<Message> {
    if req.opcode() != Opcode::BootRequest {
        debug!(xid = req.xid(), "Dropping non BootRequest packet");
        return None;
    }

    let mac = req
        .chaddr()
        .get(..6)
        .and_then(|bytes| MacAddress::from_bytes(bytes).ok())?;

    let Some(lease) = table.lookup(mac) else {
        info!(mac = %mac.to_hex_string(), "No lease found, ignoring request");
        return None;
    };

    let reply_type = match req.opts().msg_type() {
        Some(MessageType::Discover) => MessageType::Offer,
        Some(MessageType::Request) => MessageType::Ack,
        other => {
            debug!(mac = %mac.to_hex_string(), msg_type = ?other, "Unhandled message type");
            return None;
        }
    };

    let mut reply = Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        lease.client_ip,
        lease.server_ip,
        req.giaddr(),
        mac.as_bytes(),
    );
    reply.set_opcode(Opcode::BootReply).set_flags(req.flags());
    insert_options(&mut reply, &lease, reply_type);

    debug!(
        mac = %mac.to_hex_string(),
        ip = %lease.client_ip,
        msg_type = ?reply_type,
        "Replying"
    );
    Some(reply)
}

fn insert_options(reply: &mut Message, lease: &DhcpLease, reply_type: MessageType) {
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(reply_type));
    opts.insert(DhcpOption::ServerIdentifier(lease.server_ip));
    opts.insert(DhcpOption::SubnetMask(lease.subnet_mask));
    if let Some(router) = lease.router {
        opts.insert(DhcpOption::Router(vec![router]));
    }
    if !lease.dns.is_empty() {
        opts.insert(DhcpOption::DomainNameServer(lease.dns.clone()));
    }
    if let Some(domain) = lease.domain_name.as_ref().filter(|d| !d.is_empty()) {
        opts.insert(DhcpOption::DomainName(domain.clone()));
    }
    if !lease.domain_search.is_empty() {
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::DomainSearch,
            encode_domain_search(&lease.domain_search),
        )));
    }
    if !lease.ntp.is_empty() {
        opts.insert(DhcpOption::NtpServers(lease.ntp.clone()));
    }
    opts.insert(DhcpOption::AddressLeaseTime(lease.lease_time));
}

/// RFC 3397 domain search list, uncompressed.
fn encode_domain_search(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        for label in domain.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            let bytes = &label.as_bytes()[..label.len().min(63)];
            out.push(u8::try_from(bytes.len()).unwrap_or(63));
            out.extend_from_slice(bytes);
        }
        out.push(0);
    }
    out
}

/// Where the reply to a request received from `peer` is sent.
///
/// Relayed requests go back to the relay, clients without an address (or
/// asking for broadcast) get a limited broadcast, everyone else is unicast.
pub fn reply_target(req: &Message, peer: SocketAddr) -> SocketAddr {
    let giaddr = req.giaddr();
    if !giaddr.is_unspecified() {
        return SocketAddrV4::new(giaddr, SERVER_PORT).into();
    }
    if peer.ip().is_unspecified() || req.flags().broadcast() {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT).into();
    }
    peer
}

/// Decodes a datagram and encodes the reply, if any.
pub fn handle_datagram(
    table: &LeaseTable,
    buf: &[u8],
    peer: SocketAddr,
) -> Result<Option<(Vec<u8>, SocketAddr)>, DhcpError> {
    let req = Message::from_bytes(buf)?;
    let Some(reply) = build_reply(table, &req) else {
        return Ok(None);
    };
    Ok(Some((reply.to_vec()?, reply_target(&req, peer))))
}
