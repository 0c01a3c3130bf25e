//! Resolves a single service instance, like `mdns-resolve "My Printer" _ipp._tcp`.

use std::{env, process, time::Duration};

use log::LevelFilter;
use zeroconf_engine::{
    name::Label,
    service::{ServiceInstance, ServiceType},
    Engine, EngineConfig,
};

fn main() -> Result<(), zeroconf_engine::Error> {
    env_logger::Builder::new()
        .filter_module("zeroconf_engine", LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let [name, ty] = &*args else {
        eprintln!("usage: mdns-resolve <instance name> <_service._proto>");
        process::exit(1);
    };

    let engine = Engine::start(EngineConfig::default())?;
    let service_type = ServiceType::parse(ty, engine.domain())?;
    let Ok(name) = name.parse::<Label>() else {
        eprintln!("invalid instance name `{name}`");
        process::exit(1);
    };
    let instance = ServiceInstance::new(name, service_type, engine.domain().clone());

    let record = engine.resolve_once(&instance, Duration::from_secs(5))?;
    println!("{}", record);
    for (key, value) in record.to_properties() {
        println!("  {key}: {value:?}");
    }

    engine.stop();
    Ok(())
}
