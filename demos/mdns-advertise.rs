//! Advertises a service instance on all private IPv4 addresses of this machine.

use std::{env, io, net::IpAddr, process};

use log::LevelFilter;
use zeroconf_engine::{
    name::DomainName,
    service::{
        advertising::{InstanceDetails, SyncAdvertiser},
        ServiceInstance, ServiceType,
    },
};

fn main() -> io::Result<()> {
    env_logger::Builder::new()
        .filter_module("zeroconf_engine", LevelFilter::Trace)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let service_type = match &*args {
        [] => "_servicename._tcp",
        [ty] => ty.as_str(),
        _ => {
            eprintln!("usage: mdns-advertise [_service._proto]");
            process::exit(1);
        }
    };

    let local_addrs = if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(ip) if ip.is_private() => Some(ip),
            _ => None,
        })
        .collect::<Vec<_>>();
    let Some(&first_addr) = local_addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no local network interface with private IPv4 address found",
        ));
    };

    let mut advertiser = SyncAdvertiser::new(first_addr)?;
    let domain = advertiser.responder().domain().clone();
    let host = DomainName::from_str("my_hostname")?.join(&domain);
    let instance = ServiceInstance::new(
        "My Service Instance".parse()?,
        ServiceType::parse(service_type, &domain)?,
        domain,
    );

    let mut details = InstanceDetails::new(host, 1234);
    for &addr in &local_addrs {
        details.add_address(addr.into());
    }
    details.txt_records_mut().insert("path", "/");
    advertiser.add_instance(instance, details)?;
    advertiser.listen()
}
