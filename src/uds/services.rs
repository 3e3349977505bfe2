use crate::error::{EngineError, Result};
use crate::uds::client::UdsClient;
use crate::uds::correlator::Message;

/// Bench ECU CAN addresses (request id, response id)
pub mod ecu_addr {
    pub const IMC_TX: u32 = 0x7B3;
    pub const IMC_RX: u32 = 0x7BB;
    pub const GWM_TX: u32 = 0x716;
    pub const GWM_RX: u32 = 0x71E;
    pub const BCM_TX: u32 = 0x726;
    pub const BCM_RX: u32 = 0x72E;
    /// Functional (broadcast) request address
    pub const FUNCTIONAL_TX: u32 = 0x7DF;
}

/// Known DID identifiers
pub mod did {
    pub const VIN: u16 = 0xF190;
    pub const SW_VERSION: u16 = 0xF186;
    pub const SW_PART: u16 = 0xF188;
    pub const ECU_SERIAL: u16 = 0xF18C;
    /// Long record used to exercise segmented responses
    pub const DIAG_RECORD: u16 = 0xEDA0;
}

/// TesterPresent with suppressPosRspMsgIndicationBit; the ECU stays silent
pub const TESTER_PRESENT_SUPPRESS: [u8; 2] = [0x3E, 0x80];

pub const ROUTINE_START: u8 = 0x01;

/// Diagnostic session types
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DiagSession {
    Default = 0x01,
    Programming = 0x02,
    Extended = 0x03,
}

// ─── Diagnostic Session Control (0x10) ──────────────────────────────

pub fn diagnostic_session(client: &UdsClient, session: DiagSession) -> Result<Message> {
    client.send_request(&[0x10, session as u8])?.into_result()
}

// ─── TesterPresent (0x3E) ───────────────────────────────────────────

pub fn tester_present_no_response(client: &UdsClient) -> Result<()> {
    client.send_only(&TESTER_PRESENT_SUPPRESS)
}

// ─── ReadDataByIdentifier (0x22) ────────────────────────────────────

/// Read a DID. A negative answer is returned as a `Message`, not an error.
pub fn read_did(client: &UdsClient, did_id: u16) -> Result<Message> {
    let [hi, lo] = did_id.to_be_bytes();
    let message = client.send_request(&[0x22, hi, lo])?;
    match message.did() {
        Some(echoed) if echoed != did_id => Err(EngineError::InvalidResponse {
            channel: message.channel.clone(),
            reason: format!("DID 0x{:04X} answered for 0x{:04X}", echoed, did_id),
            bytes: message.raw.clone(),
        }),
        _ => Ok(message),
    }
}

/// Read a DID and return just the data record
pub fn read_did_data(client: &UdsClient, did_id: u16) -> Result<Vec<u8>> {
    Ok(read_did(client, did_id)?.into_result()?.payload().to_vec())
}

pub fn read_vin(client: &UdsClient) -> Result<String> {
    let data = read_did_data(client, did::VIN)?;
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

// ─── RoutineControl (0x31) ──────────────────────────────────────────

/// Start a routine; long-running routines answer with responsePending first
pub fn routine_start(client: &UdsClient, routine_id: u16, data: &[u8]) -> Result<Message> {
    let [hi, lo] = routine_id.to_be_bytes();
    let mut request = vec![0x31, ROUTINE_START, hi, lo];
    request.extend_from_slice(data);
    client.send_request(&request)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::CanFrame;
    use crate::bus::virtual_bus::{BusNode, Reply, VirtualBus};
    use crate::bus::BusWriter;
    use crate::channel::{Channel, ChannelSettings};
    use crate::ecu_emulator::{EcuId, EmulatedEcu};
    use crate::trace::Tracer;
    use std::sync::Arc;

    fn client_with<N: BusNode + 'static>(node: N) -> (Arc<VirtualBus>, UdsClient) {
        let bus = Arc::new(VirtualBus::new());
        bus.attach(node);
        let channel = Channel::open(
            EcuId::Imc.channel("body"),
            BusWriter::new(bus.clone()),
            ChannelSettings::default(),
            Tracer::new(),
        )
        .unwrap();
        (bus, UdsClient::new(Arc::new(channel)))
    }

    fn bench_client() -> (Arc<VirtualBus>, UdsClient) {
        client_with(EmulatedEcu::bench(EcuId::Imc, "body"))
    }

    #[test]
    fn test_diagnostic_session() {
        let (_bus, client) = bench_client();
        let message = diagnostic_session(&client, DiagSession::Extended).unwrap();
        assert_eq!(message.payload(), &[0x03, 0x00, 0x19, 0x01, 0xF4]);
    }

    #[test]
    fn test_read_did_and_vin() {
        let (_bus, client) = bench_client();
        assert_eq!(read_did_data(&client, did::SW_VERSION).unwrap(), vec![0x01]);
        assert_eq!(
            read_did_data(&client, did::DIAG_RECORD).unwrap(),
            vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
        assert_eq!(read_vin(&client).unwrap(), "SAJBL4BVXGCY16353");
    }

    #[test]
    fn test_read_did_negative() {
        let (_bus, client) = bench_client();
        let message = read_did(&client, 0xFFFF).unwrap();
        assert_eq!(message.nrc_name(), Some("requestOutOfRange"));
        assert!(matches!(
            read_did_data(&client, 0xFFFF),
            Err(EngineError::UnexpectedNegativeResponse { nrc: 0x31, .. })
        ));
    }

    /// Answers every read with DID F186, whatever was asked
    struct WrongDid;

    impl BusNode for WrongDid {
        fn on_frame(&mut self, _namespace: &str, frame: &CanFrame) -> Vec<Reply> {
            if frame.can_id != ecu_addr::IMC_TX {
                return vec![];
            }
            vec![Reply::now(CanFrame::new(
                ecu_addr::IMC_RX,
                &[0x04, 0x62, 0xF1, 0x86, 0x01],
            ))]
        }
    }

    #[test]
    fn test_read_did_checks_echoed_identifier() {
        let (_bus, client) = client_with(WrongDid);
        let err = read_did(&client, did::VIN).unwrap_err();
        assert!(matches!(err, EngineError::InvalidResponse { .. }));
        assert!(err.to_string().contains("0xF186"));
    }

    #[test]
    fn test_tester_present_no_response() {
        let (bus, client) = bench_client();
        tester_present_no_response(&client).unwrap();
        assert_eq!(
            bus.frames_on(ecu_addr::IMC_TX)[0].frame.data[..3],
            [0x02, 0x3E, 0x80]
        );
        assert!(bus.frames_on(ecu_addr::IMC_RX).is_empty());
    }

    #[test]
    fn test_routine_start_through_pending() {
        let (_bus, client) = bench_client();
        let message = routine_start(&client, 0x603E, &[]).unwrap();
        assert_eq!(message.payload(), &[0x01, 0x60, 0x3E]);
    }
}
