use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use udsbench_lib::bus::virtual_bus::VirtualBus;
use udsbench_lib::channel::ChannelId;
use udsbench_lib::ecu_emulator::{EcuId, EmulatedEcu};
use udsbench_lib::trace::hex;
use udsbench_lib::uds::services::{self, did, ecu_addr, DiagSession, TESTER_PRESENT_SUPPRESS};
use udsbench_lib::uds::UdsClient;
use udsbench_lib::{Engine, EngineConfig, Message};

const NAMESPACE: &str = "body";
const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(2000);

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// udsbench [config.json] [imc|gwm|bcm]
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let ecu: EcuId = args.next().map(|s| s.parse::<EcuId>()).transpose()?.unwrap_or(EcuId::Imc);

    let bus = Arc::new(VirtualBus::new());
    bus.attach(EmulatedEcu::bench(ecu, NAMESPACE));
    let engine = Engine::new(bus, config);
    engine.set_trace_callback(Box::new(|entry| match serde_json::to_string(&entry) {
        Ok(line) => println!("{}", line),
        Err(e) => log::warn!("trace entry not serialisable: {}", e),
    }));

    engine.subscribe_configured()?;
    let channel = ecu.channel(NAMESPACE);
    if engine.channel(&channel).is_err() {
        engine.subscribe(channel.clone())?;
    }

    if engine.start_configured_periodic()?.is_empty() {
        let functional = ChannelId::new(ecu_addr::FUNCTIONAL_TX, ecu.rx_id(), NAMESPACE);
        let mut frame = vec![TESTER_PRESENT_SUPPRESS.len() as u8];
        frame.extend_from_slice(&TESTER_PRESENT_SUPPRESS);
        engine.start_periodic(&functional, &frame, TESTER_PRESENT_INTERVAL)?;
    }

    let client = UdsClient::new(engine.channel(&channel)?);
    services::diagnostic_session(&client, DiagSession::Extended)?;
    for did_id in [did::SW_VERSION, did::DIAG_RECORD, did::SW_PART, 0xFFFF] {
        match services::read_did(&client, did_id) {
            Ok(message) => log::info!("{} DID 0x{:04X}: {}", ecu, did_id, summary(&message)),
            Err(e) => log::warn!("{} DID 0x{:04X}: {}", ecu, did_id, e),
        }
    }
    log::info!("{} VIN: {}", ecu, services::read_vin(&client)?);
    services::tester_present_no_response(&client)?;
    let routine = services::routine_start(&client, 0x603E, &[])?;
    log::info!("{} routine 0x603E: {}", ecu, summary(&routine));

    let report = serde_json::json!({
        "channel": channel,
        "messages": engine.message_log(&channel)?.len(),
        "frames": engine.frame_log(&channel)?.len(),
        "errors": engine.errors(&channel)?.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
    });
    println!("{}", report);

    engine.shutdown()?;
    Ok(())
}

fn summary(message: &Message) -> String {
    match message.nrc_name() {
        Some(name) => format!("negative, {}", name),
        None => format!("[{}]", hex(message.payload())),
    }
}
