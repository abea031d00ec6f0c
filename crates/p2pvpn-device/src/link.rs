//! Post-creation link setup (MTU, addressing, bring-up)
//!
//! [`link_plan`] turns the options into an ordered list of steps shared by
//! every backend. Linux applies the steps over rtnetlink; macOS renders them
//! as `ifconfig` invocations, which can be inspected without touching the
//! host.

use crate::config::LinkOptions;
use crate::DeviceError;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::debug;

/// One step of link configuration, in the order it must run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Mtu(u16),
    /// Local address; with a peer the link is point-to-point
    Address { local: IpNet, peer: Option<IpAddr> },
    Up,
}

impl LinkStep {
    /// Short name of the step, reported when it fails
    pub fn name(&self) -> &'static str {
        match self {
            LinkStep::Mtu(_) => "mtu",
            LinkStep::Address { .. } => "address",
            LinkStep::Up => "up",
        }
    }
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStep::Mtu(mtu) => write!(f, "mtu {}", mtu),
            LinkStep::Address {
                local,
                peer: Some(peer),
            } => write!(f, "address {} peer {}", local, peer),
            LinkStep::Address { local, peer: None } => write!(f, "address {}", local),
            LinkStep::Up => f.write_str("up"),
        }
    }
}

/// Steps needed to bring a fresh interface into service
///
/// Addressing is skipped when no local address is configured.
pub fn link_plan(options: &LinkOptions) -> Vec<LinkStep> {
    let mut plan = Vec::with_capacity(3);
    plan.push(LinkStep::Mtu(options.mtu));
    if let Some(local) = options.local_address {
        plan.push(LinkStep::Address {
            local,
            peer: options.remote_address,
        });
    }
    plan.push(LinkStep::Up);
    plan
}

/// Applies MTU, addresses and link state to a freshly created interface
#[async_trait]
pub trait LinkConfigurator: Send + Sync + fmt::Debug {
    /// Run [`link_plan`] against `name`, stopping at the first failing step
    ///
    /// Failures are reported as [`DeviceError::Configuration`] naming the step.
    async fn configure(&self, name: &str, options: &LinkOptions) -> Result<(), DeviceError>;
}

/// One system command of an `ifconfig` plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCommand {
    pub step: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
}

impl LinkCommand {
    fn new(step: &'static str, program: &'static str, args: &[&str]) -> Self {
        Self {
            step,
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Run the command, mapping any failure to [`DeviceError::Configuration`]
    pub async fn run(&self, device: &str) -> Result<(), DeviceError> {
        debug!("Running: {}", self);

        let output = Command::new(self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| self.failure(device, format!("failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(device, stderr.trim().to_string()));
        }

        Ok(())
    }

    fn failure(&self, device: &str, message: String) -> DeviceError {
        DeviceError::Configuration {
            device: device.to_string(),
            step: self.step,
            message,
        }
    }
}

impl fmt::Display for LinkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// BSD/macOS configuration through `ifconfig`
#[derive(Debug, Default, Clone, Copy)]
pub struct IfconfigConfigurator;

impl IfconfigConfigurator {
    /// `ifconfig` invocations for `name`, in execution order
    pub fn commands(&self, name: &str, options: &LinkOptions) -> Vec<LinkCommand> {
        link_plan(options)
            .iter()
            .map(|step| Self::command(name, step))
            .collect()
    }

    fn command(name: &str, step: &LinkStep) -> LinkCommand {
        let step_name = step.name();
        match *step {
            LinkStep::Mtu(mtu) => {
                let mtu = mtu.to_string();
                LinkCommand::new(step_name, "ifconfig", &[name, "mtu", &mtu])
            }
            LinkStep::Address {
                local: IpNet::V4(local),
                peer,
            } => {
                let local_addr = local.addr().to_string();
                // utun is point-to-point; without a peer it points at itself.
                let destination = peer
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| local_addr.clone());
                let netmask = local.netmask().to_string();
                LinkCommand::new(
                    step_name,
                    "ifconfig",
                    &[name, "inet", &local_addr, &destination, "netmask", &netmask],
                )
            }
            LinkStep::Address {
                local: IpNet::V6(local),
                peer,
            } => {
                let local_addr = local.addr().to_string();
                let prefix = local.prefix_len().to_string();
                match peer {
                    Some(peer) => {
                        let destination = peer.to_string();
                        LinkCommand::new(
                            step_name,
                            "ifconfig",
                            &[name, "inet6", &local_addr, &destination, "prefixlen", &prefix],
                        )
                    }
                    None => LinkCommand::new(
                        step_name,
                        "ifconfig",
                        &[name, "inet6", &local_addr, "prefixlen", &prefix],
                    ),
                }
            }
            LinkStep::Up => LinkCommand::new(step_name, "ifconfig", &[name, "up"]),
        }
    }
}

#[async_trait]
impl LinkConfigurator for IfconfigConfigurator {
    async fn configure(&self, name: &str, options: &LinkOptions) -> Result<(), DeviceError> {
        for command in self.commands(name, options) {
            command.run(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(local: Option<&str>, remote: Option<&str>) -> LinkOptions {
        LinkOptions {
            mtu: 1500,
            local_address: local.map(|l| l.parse().unwrap()),
            remote_address: remote.map(|r| r.parse().unwrap()),
        }
    }

    fn rendered(commands: &[LinkCommand]) -> Vec<String> {
        commands.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_point_to_point_plan() {
        let plan = link_plan(&options(Some("10.0.0.1/24"), Some("10.0.0.2")));

        assert_eq!(
            plan,
            vec![
                LinkStep::Mtu(1500),
                LinkStep::Address {
                    local: "10.0.0.1/24".parse().unwrap(),
                    peer: Some("10.0.0.2".parse().unwrap()),
                },
                LinkStep::Up,
            ]
        );
        assert_eq!(
            plan.iter().map(LinkStep::name).collect::<Vec<_>>(),
            vec!["mtu", "address", "up"]
        );
        assert_eq!(plan[1].to_string(), "address 10.0.0.1/24 peer 10.0.0.2");
    }

    #[test]
    fn test_plan_without_addresses_skips_addressing() {
        let plan = link_plan(&options(None, None));
        assert_eq!(plan, vec![LinkStep::Mtu(1500), LinkStep::Up]);
    }

    #[test]
    fn test_ifconfig_point_to_point_commands() {
        let commands =
            IfconfigConfigurator.commands("utun4", &options(Some("10.0.0.1/24"), Some("10.0.0.2")));
        assert_eq!(
            rendered(&commands),
            vec![
                "ifconfig utun4 mtu 1500",
                "ifconfig utun4 inet 10.0.0.1 10.0.0.2 netmask 255.255.255.0",
                "ifconfig utun4 up",
            ]
        );
        assert_eq!(
            commands.iter().map(|c| c.step).collect::<Vec<_>>(),
            vec!["mtu", "address", "up"]
        );
    }

    #[test]
    fn test_ifconfig_ipv6_keeps_the_destination() {
        let commands =
            IfconfigConfigurator.commands("utun4", &options(Some("fd00::1/64"), Some("fd00::2")));
        assert_eq!(
            commands[1].to_string(),
            "ifconfig utun4 inet6 fd00::1 fd00::2 prefixlen 64"
        );

        let commands = IfconfigConfigurator.commands("utun4", &options(Some("fd00::1/64"), None));
        assert_eq!(
            commands[1].to_string(),
            "ifconfig utun4 inet6 fd00::1 prefixlen 64"
        );
    }

    #[test]
    fn test_ifconfig_bare_commands() {
        let commands = IfconfigConfigurator.commands("utun4", &options(None, None));
        assert_eq!(
            rendered(&commands),
            vec!["ifconfig utun4 mtu 1500", "ifconfig utun4 up"]
        );
    }

    #[tokio::test]
    async fn test_failed_command_names_the_step() {
        let command = LinkCommand::new("mtu", "/nonexistent/p2pvpn-ifconfig", &["utun9"]);
        let err = command.run("utun9").await.unwrap_err();

        match err {
            DeviceError::Configuration { device, step, .. } => {
                assert_eq!(device, "utun9");
                assert_eq!(step, "mtu");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
