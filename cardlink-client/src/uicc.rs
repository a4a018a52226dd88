//! The virtual UICC.
//!
//! Incoming C-APDUs are dispatched through an `ins → handler` table
//! built at startup. The default table covers the commands a SCP81
//! session exercises; tests and embedders can swap or add handlers with
//! [`VirtualUicc::register`].

use std::collections::HashMap;
use std::sync::Arc;

use cardlink_types::apdu::{Apdu, ApduResponse};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};

/// SW for an instruction the card does not implement.
const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
/// SW for a referenced data object that does not exist.
const SW_DATA_NOT_FOUND: u16 = 0x6A88;
/// SW for success.
const SW_NO_ERROR: u16 = 0x9000;

/// Mutable card state shared by all handlers.
pub struct UiccState {
    /// AID selected by the last SELECT.
    pub selected_aid: Option<Vec<u8>>,
    /// Set once EXTERNAL AUTHENTICATE succeeded.
    pub secure_channel: bool,
    /// Response data parked for GET RESPONSE.
    pub pending: Option<Vec<u8>>,
    /// Data objects served by GET DATA, keyed by tag.
    pub data_objects: HashMap<u16, Vec<u8>>,
    /// Answer GET DATA through `61xx` chaining.
    pub response_chaining: bool,
    rng: StdRng,
}

impl UiccState {
    fn new(response_chaining: bool) -> Self {
        let mut data_objects = HashMap::new();
        // card recognition data (tag 66) and CPLC (tag 9F7F)
        data_objects.insert(
            0x0066,
            vec![
                0x66, 0x16, 0x73, 0x14, 0x06, 0x07, 0x2A, 0x86, 0x48, 0x86, 0xFC, 0x6B, 0x01,
                0x60, 0x0C, 0x06, 0x0A, 0x2A, 0x86, 0x48, 0x86, 0xFC, 0x6B, 0x02,
            ],
        );
        data_objects.insert(0x9F7F, vec![0x42; 42]);
        Self {
            selected_aid: None,
            secure_channel: false,
            pending: None,
            data_objects,
            response_chaining,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fills `buf` with card-generated randomness.
    pub fn fill_random(&mut self, buf: &mut [u8]) {
        self.rng.fill(buf);
    }
}

/// One GP command implementation.
pub trait ApduHandler: Send + Sync {
    /// Produces the card's response to `cmd`.
    fn handle(&self, cmd: &Apdu, state: &mut UiccState) -> ApduResponse;
}

/// A card simulated in memory.
pub struct VirtualUicc {
    handlers: HashMap<u8, Arc<dyn ApduHandler>>,
    state: UiccState,
}

impl VirtualUicc {
    /// Builds a card with the default handler table: SELECT (`A4`),
    /// GET STATUS (`F2`), GET DATA (`CA`), GET RESPONSE (`C0`),
    /// INITIALIZE UPDATE (`50`) and EXTERNAL AUTHENTICATE (`82`).
    pub fn new() -> Self {
        let mut handlers: HashMap<u8, Arc<dyn ApduHandler>> = HashMap::new();
        handlers.insert(0xA4, Arc::new(Select));
        handlers.insert(0xF2, Arc::new(GetStatus));
        handlers.insert(0xCA, Arc::new(GetData));
        handlers.insert(0xC0, Arc::new(GetResponse));
        handlers.insert(0x50, Arc::new(InitializeUpdate));
        handlers.insert(0x82, Arc::new(ExternalAuthenticate));
        Self {
            handlers,
            state: UiccState::new(false),
        }
    }

    /// Switches GET DATA answers to `61xx`/GET RESPONSE chaining.
    pub fn with_response_chaining(mut self, on: bool) -> Self {
        self.state.response_chaining = on;
        self
    }

    /// Installs (or replaces) the handler for an instruction byte.
    pub fn register(&mut self, ins: u8, handler: Arc<dyn ApduHandler>) {
        self.handlers.insert(ins, handler);
    }

    /// Installs a data object served by GET DATA.
    pub fn set_data_object(&mut self, tag: u16, value: Vec<u8>) {
        self.state.data_objects.insert(tag, value);
    }

    /// Dispatches one command. Unknown instructions answer `6D00`.
    pub fn handle(&mut self, cmd: &Apdu) -> ApduResponse {
        match self.handlers.get(&cmd.ins).cloned() {
            Some(handler) => handler.handle(cmd, &mut self.state),
            None => {
                tracing::debug!("unsupported instruction {:02X}", cmd.ins);
                ApduResponse::from_sw(SW_INS_NOT_SUPPORTED)
            }
        }
    }
}

impl Default for VirtualUicc {
    fn default() -> Self {
        Self::new()
    }
}

struct Select;

impl ApduHandler for Select {
    fn handle(&self, cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        state.selected_aid = Some(cmd.data.clone());
        // minimal FCI: application template with the selected AID
        let mut fci = vec![0x6F, (cmd.data.len() + 2) as u8, 0x84, cmd.data.len() as u8];
        fci.extend_from_slice(&cmd.data);
        ApduResponse::new(fci, 0x90, 0x00)
    }
}

struct GetStatus;

impl ApduHandler for GetStatus {
    fn handle(&self, _cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        // one registry entry: the ISD, life cycle OP_READY
        let aid = state
            .selected_aid
            .clone()
            .unwrap_or_else(|| vec![0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00]);
        let mut entry = vec![0xE3, (aid.len() + 7) as u8, 0x4F, aid.len() as u8];
        entry.extend_from_slice(&aid);
        entry.extend_from_slice(&[0x9F, 0x70, 0x01, 0x01]);
        ApduResponse::new(entry, 0x90, 0x00)
    }
}

struct GetData;

impl ApduHandler for GetData {
    fn handle(&self, cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        let tag = u16::from_be_bytes([cmd.p1, cmd.p2]);
        let Some(value) = state.data_objects.get(&tag).cloned() else {
            return ApduResponse::from_sw(SW_DATA_NOT_FOUND);
        };
        if state.response_chaining {
            let available = value.len().min(255) as u8;
            state.pending = Some(value);
            ApduResponse::from_sw(0x6100 | u16::from(available))
        } else {
            ApduResponse::new(value, 0x90, 0x00)
        }
    }
}

struct GetResponse;

impl ApduHandler for GetResponse {
    fn handle(&self, cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        let Some(mut pending) = state.pending.take() else {
            return ApduResponse::from_sw(SW_DATA_NOT_FOUND);
        };
        let wanted = cmd.le.unwrap_or(256) as usize;
        if pending.len() > wanted {
            let rest = pending.split_off(wanted);
            let available = rest.len().min(255) as u8;
            state.pending = Some(rest);
            ApduResponse::new(pending, 0x61, available)
        } else {
            ApduResponse::new(pending, 0x90, 0x00)
        }
    }
}

struct InitializeUpdate;

impl ApduHandler for InitializeUpdate {
    fn handle(&self, _cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        // key diversification data, key info, card challenge, cryptogram
        let mut data = vec![0u8; 28];
        data[..10].copy_from_slice(&[0x00, 0x00, 0x71, 0x02, 0x51, 0x83, 0x07, 0x90, 0x91, 0x74]);
        data[10] = 0x01; // key version
        data[11] = 0x02; // SCP02
        state.fill_random(&mut data[12..28]);
        ApduResponse::new(data, 0x90, 0x00)
    }
}

struct ExternalAuthenticate;

impl ApduHandler for ExternalAuthenticate {
    fn handle(&self, _cmd: &Apdu, state: &mut UiccState) -> ApduResponse {
        // test mode: any host cryptogram/MAC is accepted
        state.secure_channel = true;
        ApduResponse::from_sw(SW_NO_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_isd() -> Apdu {
        Apdu::case4(
            0x00,
            0xA4,
            0x04,
            0x00,
            vec![0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00],
            256,
        )
    }

    #[test]
    fn select_records_aid_and_returns_fci() {
        let mut uicc = VirtualUicc::new();
        let resp = uicc.handle(&select_isd());
        assert_eq!(resp.sw(), 0x9000);
        assert_eq!(resp.data[0], 0x6F);
        assert_eq!(
            uicc.state.selected_aid.as_deref(),
            Some(&[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00][..])
        );
    }

    #[test]
    fn unknown_instruction_answers_6d00() {
        let mut uicc = VirtualUicc::new();
        let resp = uicc.handle(&Apdu::case1(0x00, 0xEE, 0x00, 0x00));
        assert_eq!(resp.sw(), 0x6D00);
        assert!(resp.data.is_empty());
    }

    #[test]
    fn initialize_update_returns_card_challenge() {
        let mut uicc = VirtualUicc::new();
        let resp = uicc.handle(&Apdu::case4(0x80, 0x50, 0x00, 0x00, vec![0x11; 8], 256));
        assert_eq!(resp.sw(), 0x9000);
        assert_eq!(resp.data.len(), 28);

        let auth = uicc.handle(&Apdu::case3(0x84, 0x82, 0x01, 0x00, vec![0x22; 10]));
        assert_eq!(auth.sw(), 0x9000);
        assert!(uicc.state.secure_channel);
    }

    #[test]
    fn get_data_serves_objects_inline() {
        let mut uicc = VirtualUicc::new();
        let resp = uicc.handle(&Apdu::case2(0x80, 0xCA, 0x9F, 0x7F, 256));
        assert_eq!(resp.sw(), 0x9000);
        assert_eq!(resp.data.len(), 42);

        let missing = uicc.handle(&Apdu::case2(0x80, 0xCA, 0x01, 0x23, 256));
        assert_eq!(missing.sw(), 0x6A88);
    }

    #[test]
    fn chained_get_data_goes_through_get_response() {
        let mut uicc = VirtualUicc::new().with_response_chaining(true);
        uicc.set_data_object(0x0066, vec![0xAB; 32]);

        let first = uicc.handle(&Apdu::case2(0x80, 0xCA, 0x00, 0x66, 256));
        assert_eq!(first.sw(), 0x6120);
        assert!(first.data.is_empty());

        let second = uicc.handle(&Apdu::get_response(0x20));
        assert_eq!(second.sw(), 0x9000);
        assert_eq!(second.data, vec![0xAB; 32]);
    }

    #[test]
    fn get_response_chunks_large_objects() {
        let mut uicc = VirtualUicc::new().with_response_chaining(true);
        uicc.set_data_object(0x0042, vec![0x07; 300]);

        let first = uicc.handle(&Apdu::case2(0x80, 0xCA, 0x00, 0x42, 256));
        assert_eq!(first.sw(), 0x61FF);

        let chunk = uicc.handle(&Apdu::get_response(0x00));
        assert_eq!(chunk.sw1, 0x61);
        assert_eq!(chunk.data.len(), 256);

        let rest = uicc.handle(&Apdu::get_response(chunk.sw2));
        assert_eq!(rest.sw(), 0x9000);
        assert_eq!(rest.data.len(), 44);
    }
}
