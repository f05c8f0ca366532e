use std::net::Ipv4Addr;

use crate::{error::NodeError, types::MacAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    NoIp,
    GotIp,
    /// Driver-specific negative code (bad password, no AP, ...).
    Failed(i32),
}

impl LinkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::GotIp | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip_addr: Ipv4Addr,
    pub mac_addr: MacAddress,
}

pub trait NetworkLink {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), NodeError>;
    fn status(&mut self) -> LinkStatus;
    fn ip_addr(&mut self) -> Option<Ipv4Addr>;
    fn mac_addr(&mut self) -> MacAddress;
}

/// Starts association and polls the link once per tick until it reports a
/// terminal status or `timeout_ticks` run out.
pub fn associate<L, F>(
    link: &mut L,
    ssid: &str,
    passphrase: &str,
    timeout_ticks: u32,
    mut tick: F,
) -> Result<LinkInfo, NodeError>
where
    L: NetworkLink,
    F: FnMut(u32),
{
    let mac_addr = link.mac_addr();
    link.begin(ssid, passphrase)?;

    let mut status = link.status();
    let mut remaining = timeout_ticks;
    while remaining > 0 && !status.is_terminal() {
        tick(remaining);
        remaining -= 1;
        status = link.status();
    }

    if status != LinkStatus::GotIp {
        return Err(NodeError::connection(
            "wifi",
            format!("association to `{ssid}` ended with status {status:?}"),
        ));
    }

    let ip_addr = link
        .ip_addr()
        .ok_or_else(|| NodeError::connection("wifi", "link reported GotIp without an address"))?;

    Ok(LinkInfo { ip_addr, mac_addr })
}
