use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Bus, BusWriter};
use crate::channel::{Channel, ChannelId, Frame, Registry};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::periodic::{PeriodicTask, Scheduler, TaskHandle};
use crate::tp::flow_control::{is_valid_separation_time, FlowControlParams};
use crate::trace::{TraceCallback, Tracer};
use crate::uds::client::UdsClient;
use crate::uds::correlator::Message;

/// Entry point for test steps: owns the channel registry and the periodic
/// scheduler, both writing through one serialised bus path.
pub struct Engine {
    writer: BusWriter,
    config: EngineConfig,
    registry: Registry,
    scheduler: Scheduler,
    tracer: Tracer,
}

impl Engine {
    pub fn new(bus: Arc<dyn Bus>, config: EngineConfig) -> Self {
        let writer = BusWriter::new(bus);
        let tracer = Tracer::new();
        Self {
            scheduler: Scheduler::new(writer.clone(), tracer.clone()),
            writer,
            config,
            registry: Registry::new(),
            tracer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive TX/RX/ERR trace entries from every channel
    pub fn set_trace_callback(&self, callback: TraceCallback) {
        self.tracer.set_callback(callback);
    }

    pub fn clear_trace_callback(&self) {
        self.tracer.clear_callback();
    }

    // ─── Channels ───────────────────────────────────────────────

    pub fn subscribe(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.registry.subscribe(id, |id| {
            Channel::open(
                id,
                self.writer.clone(),
                self.config.channel_settings(),
                self.tracer.clone(),
            )
        })
    }

    /// Subscribe every channel listed in the config
    pub fn subscribe_configured(&self) -> Result<usize> {
        for id in &self.config.channels {
            self.subscribe(id.clone())?;
        }
        Ok(self.config.channels.len())
    }

    pub fn unsubscribe(&self, id: &ChannelId) -> Result<()> {
        self.registry.unsubscribe(id)
    }

    pub fn channel(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        self.registry.get(id)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.registry.ids()
    }

    // ─── Requests ───────────────────────────────────────────────

    /// Send a UDS request and wait for its final response.
    /// Negative responses come back as `Ok`, see [`Message::into_result`].
    pub fn send_request(&self, id: &ChannelId, payload: &[u8]) -> Result<Message> {
        UdsClient::new(self.registry.get(id)?).send_request(payload)
    }

    /// Send without waiting for an answer
    pub fn send_only(&self, id: &ChannelId, payload: &[u8]) -> Result<()> {
        UdsClient::new(self.registry.get(id)?).send_only(payload)
    }

    /// Most recent message completed on the channel, solicited or not
    pub fn read_latest(&self, id: &ChannelId) -> Result<Option<Message>> {
        Ok(self.registry.get(id)?.latest_message())
    }

    pub fn frame_log(&self, id: &ChannelId) -> Result<Vec<Frame>> {
        Ok(self.registry.get(id)?.frame_log())
    }

    pub fn message_log(&self, id: &ChannelId) -> Result<Vec<Message>> {
        Ok(self.registry.get(id)?.message_log())
    }

    /// Receive-side failures recorded on the channel
    pub fn errors(&self, id: &ChannelId) -> Result<Vec<EngineError>> {
        Ok(self.registry.get(id)?.errors())
    }

    pub fn clear_logs(&self, id: &ChannelId) -> Result<()> {
        self.registry.get(id)?.clear_logs();
        Ok(())
    }

    // ─── Flow control ───────────────────────────────────────────

    pub fn set_flow_control_params(
        &self,
        id: &ChannelId,
        block_size: u8,
        separation_time: u8,
        delay: Duration,
        auto: bool,
    ) -> Result<()> {
        let channel = self.registry.get(id)?;
        if !is_valid_separation_time(separation_time) {
            return Err(EngineError::InvalidParameter {
                channel: id.clone(),
                reason: format!("separation time 0x{:02X} is reserved", separation_time),
            });
        }
        channel.set_flow_control_params(FlowControlParams {
            block_size,
            separation_time,
            frame_control_delay_ms: delay.as_millis() as u64,
            frame_control_auto: auto,
        });
        Ok(())
    }

    /// Emit a ContinueToSend by hand, for channels with automatic flow control off
    pub fn send_flow_control(&self, id: &ChannelId) -> Result<()> {
        self.registry.get(id)?.send_flow_control()
    }

    // ─── Periodic transmissions ─────────────────────────────────

    /// `frame` is sent as-is on `channel.send_id`; the channel does not need
    /// to be subscribed.
    pub fn start_periodic(
        &self,
        channel: &ChannelId,
        frame: &[u8],
        interval: Duration,
    ) -> Result<TaskHandle> {
        self.scheduler.start(channel, frame, interval)
    }

    pub fn stop_periodic(&self, handle: TaskHandle) -> Result<()> {
        self.scheduler.stop(handle)
    }

    pub fn periodic_tasks(&self) -> Vec<PeriodicTask> {
        self.scheduler.running()
    }

    /// Start every periodic task listed in the config
    pub fn start_configured_periodic(&self) -> Result<Vec<TaskHandle>> {
        let mut handles = Vec::with_capacity(self.config.periodic.len());
        for task in &self.config.periodic {
            let frame = task
                .frame_bytes()
                .map_err(|e| EngineError::InvalidPeriodicFrame {
                    channel: task.channel.clone(),
                    bytes: Vec::new(),
                    reason: e.to_string(),
                })?;
            handles.push(self.start_periodic(&task.channel, &frame, task.interval())?);
        }
        Ok(handles)
    }

    // ─── Teardown ───────────────────────────────────────────────

    /// Stop every periodic task, then close every channel. Every step runs
    /// even if an earlier one fails; the first failure is returned.
    /// Reassemblies still in flight are discarded.
    pub fn shutdown(&self) -> Result<()> {
        let tasks = self.scheduler.stop_all();
        let channels = self.registry.len();
        let errors = self.registry.clear();
        for e in &errors {
            log::error!("teardown: {}", e);
        }
        log::info!(
            "engine shut down: {} periodic tasks stopped, {} channels closed",
            tasks,
            channels
        );
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::CanFrame;
    use crate::bus::virtual_bus::VirtualBus;
    use crate::channel::tests::wait_until;
    use crate::ecu_emulator::{EcuId, EmulatedEcu, FlowBehaviour};
    use crate::trace::LogDirection;
    use crate::uds::services;
    use std::sync::Mutex;
    use std::time::Instant;

    fn imc() -> ChannelId {
        EcuId::Imc.channel("body")
    }

    fn bench(ecu: EmulatedEcu, config: EngineConfig) -> (Arc<VirtualBus>, Engine) {
        let bus = Arc::new(VirtualBus::new());
        bus.attach(ecu);
        let engine = Engine::new(bus.clone(), config);
        engine.subscribe(imc()).unwrap();
        (bus, engine)
    }

    fn default_bench() -> (Arc<VirtualBus>, Engine) {
        bench(EmulatedEcu::bench(EcuId::Imc, "body"), EngineConfig::default())
    }

    fn tester_frames(bus: &VirtualBus) -> Vec<Vec<u8>> {
        bus.frames_on(0x7B3).into_iter().map(|s| s.frame.data).collect()
    }

    #[test]
    fn test_read_single_frame_record() {
        let (bus, engine) = default_bench();
        let message = engine.send_request(&imc(), &[0x22, 0xF1, 0x86]).unwrap();
        assert_eq!(message.sid, 0x62);
        assert_eq!(message.did(), Some(0xF186));
        assert_eq!(message.payload(), &[0x01]);
        assert_eq!(
            bus.frames_on(0x7BB)[0].frame.data,
            vec![0x04, 0x62, 0xF1, 0x86, 0x01, 0x00, 0x00, 0x00]
        );
        let latest = engine.read_latest(&imc()).unwrap().unwrap();
        assert_eq!(latest.raw, message.raw);
        assert_eq!(latest.did(), Some(0xF186));
    }

    #[test]
    fn test_read_multi_frame_record() {
        let (bus, engine) = default_bench();
        let message = engine.send_request(&imc(), &[0x22, 0xED, 0xA0]).unwrap();
        assert_eq!(message.did(), Some(0xEDA0));
        assert_eq!(message.payload(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(message.payload_length(), 7);

        let sent = tester_frames(&bus);
        assert_eq!(sent[0], vec![0x03, 0x22, 0xED, 0xA0, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(sent[1], vec![0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(engine.frame_log(&imc()).unwrap().len(), 2);
    }

    #[test]
    fn test_negative_response_result() {
        let (_bus, engine) = default_bench();
        let message = engine.send_request(&imc(), &[0x22, 0xFF, 0xFF]).unwrap();
        assert!(message.is_negative());
        assert_eq!(message.nrc_name(), Some("requestOutOfRange"));
    }

    #[test]
    fn test_segmented_request_back_to_back() {
        let (bus, engine) = default_bench();
        let request: Vec<u8> = [0x2E, 0xF1, 0x90]
            .iter()
            .copied()
            .chain(1..=9u8)
            .collect();
        let message = engine.send_request(&imc(), &request).unwrap();
        assert_eq!(message.sid, 0x6E);
        assert_eq!(message.did(), Some(0xF190));

        let sent = tester_frames(&bus);
        assert_eq!(sent[0], vec![0x10, 0x0C, 0x2E, 0xF1, 0x90, 0x01, 0x02, 0x03]);
        assert_eq!(sent[1], vec![0x21, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x00]);
    }

    #[test]
    fn test_segmented_request_respects_peer_block_size_and_separation_time() {
        let ecu = EmulatedEcu::bench(EcuId::Imc, "body").with_flow_control(2, 15);
        let (bus, engine) = bench(ecu, EngineConfig::default());
        let mut request = vec![0x2E, 0xF1, 0x90];
        request.extend(0..23u8);
        engine.send_request(&imc(), &request).unwrap();

        let wire: Vec<_> = bus
            .sent_frames()
            .into_iter()
            .filter(|s| s.frame.can_id == 0x7B3 || s.frame.data[0] >> 4 == 0x3)
            .collect();
        let kinds: Vec<u8> = wire.iter().map(|s| s.frame.data[0]).collect();
        // FF, FC, CF1, CF2, FC, CF3 then the response SF
        assert_eq!(kinds[..6], [0x10, 0x30, 0x21, 0x22, 0x30, 0x23]);

        let cf_times: Vec<Instant> = wire
            .iter()
            .filter(|s| s.frame.can_id == 0x7B3 && s.frame.data[0] >> 4 == 0x2)
            .map(|s| s.at)
            .collect();
        assert_eq!(cf_times.len(), 3);
        for pair in cf_times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_response_pending_keeps_request_alive() {
        let ecu = EmulatedEcu::bench(EcuId::Imc, "body")
            .with_pending_interval(Duration::from_millis(60));
        let mut config = EngineConfig::default();
        config.timing.p2_ms = 100;
        let (_bus, engine) = bench(ecu, config);
        let client = UdsClient::new(engine.channel(&imc()).unwrap());
        let message = services::routine_start(&client, 0x603E, &[]).unwrap();
        assert_eq!(message.sid, 0x71);
        // Both pending frames were logged, the final answer is the latest
        let log = engine.message_log(&imc()).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].nrc_name(), Some("responsePending"));
        assert_eq!(engine.read_latest(&imc()).unwrap().unwrap().sid, 0x71);
    }

    #[test]
    fn test_overlapping_requests_take_turns() {
        let ecu = EmulatedEcu::bench(EcuId::Imc, "body")
            .with_pending_interval(Duration::from_millis(40));
        let mut config = EngineConfig::default();
        config.timing.p2_ms = 100;
        let (bus, engine) = bench(ecu, config);
        std::thread::scope(|s| {
            let routine = s.spawn(|| engine.send_request(&imc(), &[0x31, 0x01, 0x60, 0x3E]));
            std::thread::sleep(Duration::from_millis(20));
            let read = s.spawn(|| engine.send_request(&imc(), &[0x22, 0xF1, 0x86]));

            let routine = routine.join().unwrap().unwrap();
            assert_eq!(routine.sid, 0x71);
            let read = read.join().unwrap().unwrap();
            assert_eq!(read.did(), Some(0xF186));
            assert_eq!(read.payload(), &[0x01]);
        });
        // The read only went out once the routine had its final answer
        let requests = tester_frames(&bus);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0][1], 0x31);
        assert_eq!(requests[1][1], 0x22);
    }

    #[test]
    fn test_response_timeout_is_distinguishable() {
        let mut config = EngineConfig::default();
        config.timing.p2_ms = 50;
        let (bus, engine) = bench(EmulatedEcu::bench(EcuId::Imc, "body"), config);
        bus.set_silent(true);
        let err = engine.send_request(&imc(), &[0x22, 0xF1, 0x86]).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.channel(), Some(&imc()));
    }

    #[test]
    fn test_flow_control_failures() {
        let request = [0x2E, 0xF1, 0x90, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        let mut config = EngineConfig::default();
        config.timing.n_bs_ms = 50;
        let ecu = EmulatedEcu::bench(EcuId::Imc, "body").with_flow_behaviour(FlowBehaviour::Silent);
        let (_bus, engine) = bench(ecu, config);
        assert!(matches!(
            engine.send_request(&imc(), &request),
            Err(EngineError::FlowControlTimeout { .. })
        ));

        let ecu =
            EmulatedEcu::bench(EcuId::Imc, "body").with_flow_behaviour(FlowBehaviour::Overflow);
        let (_bus, engine) = bench(ecu, EngineConfig::default());
        let err = engine.send_request(&imc(), &request).unwrap_err();
        assert!(matches!(err, EngineError::FlowControlRejected { .. }));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_wait_frames_rearm_flow_control_timeout() {
        let request = [0x2E, 0xF1, 0x90, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        // Three 20 ms waits outlast a 35 ms N_Bs only if each Wait re-arms it
        let mut config = EngineConfig::default();
        config.timing.n_bs_ms = 35;
        let ecu =
            EmulatedEcu::bench(EcuId::Imc, "body").with_flow_behaviour(FlowBehaviour::Waits(3));
        let (_bus, engine) = bench(ecu, config);
        assert_eq!(engine.send_request(&imc(), &request).unwrap().sid, 0x6E);

        let mut config = EngineConfig::default();
        config.timing.wait_frame_max = 2;
        let ecu =
            EmulatedEcu::bench(EcuId::Imc, "body").with_flow_behaviour(FlowBehaviour::Waits(3));
        let (_bus, engine) = bench(ecu, config);
        assert!(matches!(
            engine.send_request(&imc(), &request),
            Err(EngineError::WaitLimitExceeded { waits: 3, .. })
        ));
    }

    #[test]
    fn test_set_flow_control_params() {
        let (bus, engine) = default_bench();
        assert!(matches!(
            engine.set_flow_control_params(&imc(), 0, 0x80, Duration::ZERO, true),
            Err(EngineError::InvalidParameter { .. })
        ));
        engine
            .set_flow_control_params(&imc(), 4, 0xF5, Duration::from_millis(10), true)
            .unwrap();
        engine.send_request(&imc(), &[0x22, 0xED, 0xA0]).unwrap();
        assert_eq!(tester_frames(&bus)[1][..3], [0x30, 0x04, 0xF5]);
    }

    #[test]
    fn test_manual_flow_control() {
        let (bus, engine) = default_bench();
        engine
            .set_flow_control_params(&imc(), 0, 0, Duration::ZERO, false)
            .unwrap();
        std::thread::scope(|s| {
            let request = s.spawn(|| engine.send_request(&imc(), &[0x22, 0xED, 0xA0]));
            assert!(wait_until(|| engine.frame_log(&imc()).unwrap().len() == 1));
            assert_eq!(tester_frames(&bus).len(), 1);
            engine.send_flow_control(&imc()).unwrap();
            let message = request.join().unwrap().unwrap();
            assert_eq!(message.did(), Some(0xEDA0));
        });
    }

    #[test]
    fn test_periodic_traffic_alongside_requests() {
        let (bus, engine) = default_bench();
        let functional = ChannelId::new(0x7DF, 0x7E8, "body");
        let handle = engine
            .start_periodic(&functional, &[0x02, 0x3E, 0x80], Duration::from_millis(2))
            .unwrap();
        for _ in 0..5 {
            let message = engine.send_request(&imc(), &[0x22, 0xED, 0xA0]).unwrap();
            assert_eq!(message.payload_length(), 7);
        }
        assert!(engine.errors(&imc()).unwrap().is_empty());
        engine.stop_periodic(handle).unwrap();
        let count = bus.frames_on(0x7DF).len();
        assert!(count > 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.frames_on(0x7DF).len(), count);
        assert!(engine.periodic_tasks().is_empty());
    }

    #[test]
    fn test_channel_lifecycle_errors() {
        let (_bus, engine) = default_bench();
        assert!(matches!(
            engine.subscribe(imc()),
            Err(EngineError::ChannelExists { .. })
        ));
        let other = EcuId::Bcm.channel("body");
        assert!(matches!(
            engine.send_request(&other, &[0x22, 0xF1, 0x90]),
            Err(EngineError::UnknownChannel { .. })
        ));
        engine.unsubscribe(&imc()).unwrap();
        assert!(engine.read_latest(&imc()).is_err());
        assert!(engine.channels().is_empty());
    }

    #[test]
    fn test_shutdown_mid_reassembly() {
        let (bus, engine) = default_bench();
        engine
            .start_periodic(&imc(), &[0x02, 0x3E, 0x80], Duration::from_millis(5))
            .unwrap();
        bus.inject(
            "body",
            CanFrame::new(0x7BB, &[0x10, 0x20, 0x62, 0xED, 0xA0, 1, 2, 3]),
        );
        assert!(wait_until(|| engine.frame_log(&imc()).unwrap().len() == 1));

        engine.shutdown().unwrap();
        assert!(engine.channels().is_empty());
        assert!(engine.periodic_tasks().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
        let count = bus.sent_frames().len();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.sent_frames().len(), count);
        // Second teardown has nothing left to do
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_trace_callback() {
        let (_bus, engine) = default_bench();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_trace_callback(Box::new(move |entry| sink.lock().unwrap().push(entry)));
        engine.send_request(&imc(), &[0x22, 0xFF, 0xFF]).unwrap();
        engine.clear_trace_callback();
        engine.send_request(&imc(), &[0x22, 0xF1, 0x86]).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].direction, LogDirection::Tx);
        assert_eq!(seen[0].channel, "body 0x7B3->0x7BB");
        assert_eq!(seen[1].direction, LogDirection::Error);
        assert!(seen[1].description.contains("requestOutOfRange"));
    }

    #[test]
    fn test_configured_channels_and_periodic() {
        let config = EngineConfig::from_json_str(
            r#"{
                "channels": [{"send_id": "0x7B3", "receive_id": "0x7BB", "namespace": "body"}],
                "periodic": [
                    {"channel": {"send_id": "0x7DF", "receive_id": "0x7E8", "namespace": "body"},
                     "frame": "02 3E 80", "interval_ms": 10}
                ]
            }"#,
        )
        .unwrap();
        let bus = Arc::new(VirtualBus::new());
        bus.attach(EmulatedEcu::bench(EcuId::Imc, "body"));
        let engine = Engine::new(bus.clone(), config);

        assert_eq!(engine.subscribe_configured().unwrap(), 1);
        let handles = engine.start_configured_periodic().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(engine.periodic_tasks()[0].frame_template, vec![0x02, 0x3E, 0x80]);

        let vin = services::read_vin(&UdsClient::new(engine.channel(&imc()).unwrap())).unwrap();
        assert_eq!(vin, "SAJBL4BVXGCY16353");
        assert!(wait_until(|| !bus.frames_on(0x7DF).is_empty()));
        engine.shutdown().unwrap();
    }
}
