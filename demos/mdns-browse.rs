//! Browses for instances of a service type and prints discovery events until interrupted.

use std::{env, process, sync::Arc, thread};

use log::LevelFilter;
use zeroconf_engine::{
    service::{ServiceInstance, ServiceRecord, ServiceType},
    Engine, EngineConfig, ErrorKind, HostNotifier,
};

struct Printer;

impl HostNotifier for Printer {
    fn on_service_found(&self, record: &ServiceRecord) {
        println!("+ {}", record);
    }

    fn on_service_updated(&self, record: &ServiceRecord) {
        println!("~ {}", record);
    }

    fn on_service_removed(&self, instance: &ServiceInstance) {
        println!("- {}", instance);
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        eprintln!("error ({kind:?}): {detail}");
    }

    fn on_browse_started(&self, service_type: &ServiceType) {
        println!("browsing for {}", service_type);
    }
}

fn main() -> Result<(), zeroconf_engine::Error> {
    env_logger::Builder::new()
        .filter_module("zeroconf_engine", LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let service_type = match &*args {
        [] => "_http._tcp",
        [ty] => ty.as_str(),
        _ => {
            eprintln!("usage: mdns-browse [_service._proto]");
            process::exit(1);
        }
    };

    let engine = Engine::start(EngineConfig::default())?;
    let _subscription = engine.browse(service_type, Arc::new(Printer))?;
    loop {
        thread::park();
    }
}
