//! Linux link setup over rtnetlink

use crate::config::LinkOptions;
use crate::link::{link_plan, LinkConfigurator, LinkStep};
use crate::DeviceError;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::Handle;
use std::net::IpAddr;
use tracing::debug;

/// Linux configuration through the kernel's route netlink socket
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkConfigurator;

fn failure(device: &str, step: &'static str, message: impl ToString) -> DeviceError {
    DeviceError::Configuration {
        device: device.to_string(),
        step,
        message: message.to_string(),
    }
}

#[async_trait]
impl LinkConfigurator for NetlinkConfigurator {
    async fn configure(&self, name: &str, options: &LinkOptions) -> Result<(), DeviceError> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| failure(name, "netlink", e))?;
        let connection = tokio::spawn(connection);

        let result = apply(&handle, name, options).await;

        connection.abort();
        result
    }
}

async fn apply(handle: &Handle, name: &str, options: &LinkOptions) -> Result<(), DeviceError> {
    let index = link_index(handle, name).await?;

    for step in link_plan(options) {
        debug!("netlink: {} on {} (index {})", step, name, index);

        let result = match step {
            LinkStep::Mtu(mtu) => handle.link().set(index).mtu(mtu.into()).execute().await,
            LinkStep::Address { local, peer } => add_address(handle, index, local, peer).await,
            LinkStep::Up => handle.link().set(index).up().execute().await,
        };
        result.map_err(|e| failure(name, step.name(), e))?;
    }

    Ok(())
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32, DeviceError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(failure(name, "lookup", "no such link")),
        Err(e) => Err(failure(name, "lookup", e)),
    }
}

/// Same as `ip addr add <local> peer <peer>/<prefix> dev <link>`
async fn add_address(
    handle: &Handle,
    index: u32,
    local: IpNet,
    peer: Option<IpAddr>,
) -> Result<(), rtnetlink::Error> {
    let mut request = handle
        .address()
        .add(index, local.addr(), local.prefix_len());

    if let Some(peer) = peer {
        // IFA_LOCAL stays ours; IFA_ADDRESS names the far end.
        let attributes = &mut request.message_mut().attributes;
        attributes.retain(|attr| {
            !matches!(
                attr,
                AddressAttribute::Address(_) | AddressAttribute::Broadcast(_)
            )
        });
        attributes.push(AddressAttribute::Address(peer));
    }

    request.execute().await
}
