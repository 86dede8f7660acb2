use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` failed with {status}", args.join(" ")),
        ));
    }
    Ok(())
}

/// Give the host side of `iface_name` the address `ip_cidr` and bring it up
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> io::Result<()> {
    run_ip(&["addr", "add", ip_cidr, "dev", iface_name])?;
    run_ip(&["link", "set", "up", "dev", iface_name])?;
    tracing::info!(iface = iface_name, addr = ip_cidr, "host side configured");
    Ok(())
}

/// Split `a.b.c.d/len` into the address and prefix length
pub fn parse_ip_cidr(ip_cidr: &str) -> io::Result<(Ipv4Addr, u8)> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{what}: {ip_cidr}"));
    let (addr, prefix) = ip_cidr
        .split_once('/')
        .ok_or_else(|| invalid("missing prefix length"))?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("invalid address"))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("invalid prefix length"))?;
    if prefix > 32 {
        return Err(invalid("prefix length above 32"));
    }
    Ok((addr, prefix))
}
