//! Polls a Bluetti power station over a BLE transport.
//!
//! One [`DeviceReader`] owns the whole session: it connects with retries,
//! subscribes to notifications, negotiates link encryption when the device
//! advertises it, then walks the device profile's register reads and merges
//! everything into one snapshot. A failing register read is skipped; only
//! transport failures, the overall timeout and a failed handshake abort a
//! polling cycle, and those yield "no data" instead of an error.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bluettibt_lib::crypt::PlainLink;
//! use bluettibt_lib::device::{build_device, BluettiDevice};
//! use bluettibt_lib::reader::DeviceReader;
//! # use bluettibt_lib::ble::BluestTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let device = Arc::new(build_device("AC70P", "2345000123456").unwrap());
//!     let transport = Arc::new(BluestTransport::new(&device.advertisement_name()).await.unwrap());
//!     let reader = DeviceReader::new(transport, device, Box::new(PlainLink));
//!     if let Some(data) = reader.poll(None).await {
//!         for (field, value) in &data {
//!             println!("{field}: {value}");
//!         }
//!     }
//! }
//! ```

use crate::crypt::{HandshakeState, LinkCrypto, LinkStep};
use crate::device::BluettiDevice;
use crate::fields::FieldValue;
use crate::protocol::DeviceCommand;
use crate::transport::{Transport, NOTIFY_UUID, WRITE_UUID};
use crate::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_MAX_STEPS: u32 = 6;
// Pack data is only valid a while after switching packs.
const PACK_SWITCH_DELAY: Duration = Duration::from_secs(5);

/// Session state living behind the polling lock.
struct Session {
    has_notifier: bool,
    handshake: HandshakeState,
}

/// State shared with the notification callback. At most one expectation is
/// armed at a time; notifications arriving without one are dropped.
struct LinkState {
    crypto: Box<dyn LinkCrypto>,
    crypt_enabled: bool,
    crypting: bool,
    current_command: Option<DeviceCommand>,
    response: Vec<u8>,
    waiter: Option<oneshot::Sender<Result<Vec<u8>, Error>>>,
}

impl LinkState {
    fn new(crypto: Box<dyn LinkCrypto>) -> Self {
        Self {
            crypto,
            crypt_enabled: false,
            crypting: false,
            current_command: None,
            response: Vec::new(),
            waiter: None,
        }
    }

    /// Register a fresh expectation and hand back the receiving end.
    fn arm(
        &mut self,
        command: Option<DeviceCommand>,
        crypting: bool,
    ) -> oneshot::Receiver<Result<Vec<u8>, Error>> {
        let (tx, rx) = oneshot::channel();
        self.waiter = Some(tx);
        self.current_command = command;
        self.response.clear();
        self.crypting = crypting;
        rx
    }

    fn disarm(&mut self) {
        self.waiter = None;
        self.current_command = None;
        self.response.clear();
    }

    fn resolve(&mut self, result: Result<Vec<u8>, Error>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn encode_frame(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if self.crypt_enabled {
            self.crypto.encode(data)
        } else {
            Ok(data.to_vec())
        }
    }

    fn handle_notification(&mut self, data: Vec<u8>) {
        if self.waiter.is_none() {
            log::warn!("Unexpected notification: {}", hex::encode(&data));
            return;
        }

        // A broken link sometimes echoes AT commands back at us.
        if data == b"AT+NAME?\r" || data == b"AT+ADV?\r" {
            self.resolve(Err(Error::BadConnection("got AT command echo".into())));
            return;
        }

        if self.crypting {
            // Handshake traffic is delivered raw to the negotiation loop.
            self.response.extend_from_slice(&data);
            let step_data = std::mem::take(&mut self.response);
            self.resolve(Ok(step_data));
            return;
        }

        let decoded = if self.crypt_enabled {
            match self.crypto.decode(&data) {
                Ok(decoded) if !decoded.is_empty() => decoded,
                _ => {
                    let msg = format!("failed to decrypt response: {}", hex::encode(&data));
                    self.resolve(Err(Error::Parse(msg)));
                    return;
                }
            }
        } else {
            data
        };
        self.response.extend_from_slice(&decoded);

        let Some(command) = &self.current_command else {
            log::warn!("Notification without a command in flight");
            return;
        };

        if self.response.len() == command.response_size() {
            if command.is_valid_response(&self.response) {
                let response = std::mem::take(&mut self.response);
                self.resolve(Ok(response));
            } else {
                self.resolve(Err(Error::Parse("failed checksum".into())));
            }
        } else if command.is_exception_response(&self.response) {
            let code = command.exception_code(&self.response);
            self.resolve(Err(Error::ModbusException(code)));
        }
        // Anything shorter is a partial frame; keep accumulating until the
        // command timeout fires.
    }
}

/// Reads one aggregated data snapshot per polling cycle from a device.
pub struct DeviceReader {
    transport: Arc<dyn Transport>,
    device: Arc<dyn BluettiDevice>,
    persistent_conn: bool,
    polling_timeout: Duration,
    response_timeout: Duration,
    max_retries: u32,
    polling_lock: tokio::sync::Mutex<Session>,
    shared: Arc<Mutex<LinkState>>,
}

impl DeviceReader {
    pub fn new(
        transport: Arc<dyn Transport>,
        device: Arc<dyn BluettiDevice>,
        crypto: Box<dyn LinkCrypto>,
    ) -> Self {
        Self {
            transport,
            device,
            persistent_conn: false,
            polling_timeout: Duration::from_secs(45),
            response_timeout: Duration::from_secs(5),
            max_retries: 5,
            polling_lock: tokio::sync::Mutex::new(Session {
                has_notifier: false,
                handshake: HandshakeState::Unknown,
            }),
            shared: Arc::new(Mutex::new(LinkState::new(crypto))),
        }
    }

    /// Keep the connection open between polling cycles.
    pub fn set_persistent_conn(&mut self, persistent: bool) {
        self.persistent_conn = persistent;
    }

    /// Wall-clock bound on one whole polling cycle.
    pub fn set_polling_timeout(&mut self, timeout: Duration) {
        self.polling_timeout = timeout;
    }

    /// Timeout for a single register read or write.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Number of connection attempts before giving up on a cycle.
    pub fn set_retries(&mut self, n_retries: u32) {
        self.max_retries = n_retries;
    }

    /// Encryption negotiation state of the current session.
    pub async fn handshake_state(&self) -> HandshakeState {
        self.polling_lock.lock().await.handshake
    }

    /// Run one polling cycle and return the aggregated snapshot, or `None`
    /// if nothing could be read this round.
    pub async fn poll(
        &self,
        filter: Option<&[DeviceCommand]>,
    ) -> Option<HashMap<String, FieldValue>> {
        log::info!("Reading data from {}", self.device.advertisement_name());

        let (polling_commands, pack_commands) = match filter {
            Some(commands) => (commands.to_vec(), Vec::new()),
            None => (
                self.device.polling_commands(),
                self.device.pack_polling_commands(),
            ),
        };
        log::debug!(
            "Polling commands: {}",
            polling_commands
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Whether the link has to be encrypted.
        let enable_crypt = match self.transport.discover(DISCOVERY_TIMEOUT).await {
            Ok(devices) => {
                let name = self.device.advertisement_name();
                devices
                    .iter()
                    .filter(|d| d.name.as_deref() == Some(name.as_str()))
                    .any(|d| d.has_encryption_marker())
            }
            Err(err) => {
                log::error!("Discovery failed: {err}");
                return None;
            }
        };

        let mut session = self.polling_lock.lock().await;

        let result = tokio::time::timeout(
            self.polling_timeout,
            self.run_cycle(&mut session, enable_crypt, &polling_commands, &pack_commands),
        )
        .await;

        // Teardown runs on every exit path unless the connection is meant to
        // outlive the cycle.
        if !self.persistent_conn {
            self.teardown(&mut session).await;
        }

        let parsed_data = match result {
            Ok(Ok(parsed_data)) => parsed_data,
            Ok(Err(err)) => {
                log::error!("Polling failed: {err}");
                return None;
            }
            Err(_) => {
                log::error!(
                    "Polling timed out ({:?}). Trying again later",
                    self.polling_timeout
                );
                return None;
            }
        };

        if parsed_data.is_empty() {
            return None;
        }
        Some(parsed_data)
    }

    async fn run_cycle(
        &self,
        session: &mut Session,
        enable_crypt: bool,
        polling_commands: &[DeviceCommand],
        pack_commands: &[DeviceCommand],
    ) -> Result<HashMap<String, FieldValue>, Error> {
        if !enable_crypt {
            session.handshake = HandshakeState::Disabled;
        }

        // Reconnect if not connected.
        for attempt in 1..=self.max_retries {
            if self.transport.is_connected().await {
                break;
            }
            {
                let mut link = self.shared.lock();
                link.crypt_enabled = enable_crypt;
                link.crypto.reset();
                if enable_crypt {
                    log::info!("Crypt module version: {}", link.crypto.version());
                }
            }
            match self.transport.connect().await {
                Ok(()) => {
                    if enable_crypt {
                        session.handshake = HandshakeState::Negotiating;
                    }
                    break;
                }
                Err(err) => {
                    if attempt == self.max_retries {
                        return Err(err);
                    }
                    log::warn!("Connect unsuccessful (attempt {attempt}): {err}. Retrying...");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }

        // Attach notifier if needed.
        if !session.has_notifier {
            let shared = Arc::clone(&self.shared);
            self.transport
                .subscribe(
                    NOTIFY_UUID,
                    Box::new(move |data| shared.lock().handle_notification(data)),
                )
                .await?;
            session.has_notifier = true;
        }

        // Encrypt the link if needed.
        if session.handshake == HandshakeState::Negotiating {
            match self.encrypt_link(session).await {
                Ok(()) => log::info!("Encrypted link established"),
                Err(err) => {
                    // Never leave the link half-open.
                    if session.has_notifier {
                        if let Err(err) = self.transport.unsubscribe(NOTIFY_UUID).await {
                            log::debug!("Unsubscribe failed: {err}");
                        }
                        session.has_notifier = false;
                    }
                    if let Err(err) = self.transport.disconnect().await {
                        log::debug!("Disconnect failed: {err}");
                    }
                    return Err(err);
                }
            }
        }

        let mut parsed_data: HashMap<String, FieldValue> = HashMap::new();

        // Execute polling commands.
        for command in polling_commands {
            match self.execute_command(command).await {
                Ok(parsed) => parsed_data.extend(parsed),
                Err(err) => log::warn!("Skipping {command}: {err}"),
            }
        }

        // Execute pack polling commands.
        if !pack_commands.is_empty() && self.device.pack_num_address().is_some() {
            log::debug!("Polling battery packs");
            for pack in 1..=self.device.pack_num_max() {
                log::debug!("Setting pack_num to {pack}");
                match self.select_pack(pack).await {
                    Ok(selected) if selected == u16::from(pack) => {}
                    Ok(selected) => {
                        log::warn!(
                            "Pack polling failed (pack_num {selected} doesn't match expected {pack})"
                        );
                        continue;
                    }
                    Err(err) => {
                        log::warn!("Pack select failed: {err}");
                        continue;
                    }
                }

                if self.device.pack_num_max() > 1 {
                    // Give the device time to latch data for the new pack.
                    tokio::time::sleep(PACK_SWITCH_DELAY).await;
                }

                for command in pack_commands {
                    match self.execute_command(command).await {
                        Ok(parsed) => {
                            for (key, value) in parsed {
                                // Zero means the pack slot is unpopulated.
                                if !value.is_zero() {
                                    parsed_data.insert(format!("{key}{pack}"), value);
                                }
                            }
                        }
                        Err(err) => log::warn!("Skipping pack command {command}: {err}"),
                    }
                }
            }
        }

        Ok(parsed_data)
    }

    /// Drive the encryption negotiation until it is established, bounded at
    /// [`HANDSHAKE_MAX_STEPS`] steps of one notification each.
    async fn encrypt_link(&self, session: &mut Session) -> Result<(), Error> {
        for _ in 0..HANDSHAKE_MAX_STEPS {
            let receiver = self.shared.lock().arm(None, true);
            let notification =
                match tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, receiver).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(Error::BadConnection("notification channel closed".into())),
                    Err(_) => {
                        log::warn!("Encrypt link timeout");
                        continue;
                    }
                };
            let data = match notification {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("Handshake notification error: {err}");
                    continue;
                }
            };

            let step = self.shared.lock().crypto.negotiate_link(&data);
            match step {
                LinkStep::SendSerial => {
                    // Send the serial number so the device can authorize us.
                    session.handshake = HandshakeState::SerialExchange;
                    for command in self.device.read_sn_commands() {
                        let frame = self.shared.lock().encode_frame(command.frame())?;
                        self.transport.write(WRITE_UUID, &frame).await?;
                    }
                }
                LinkStep::Established => {
                    session.handshake = HandshakeState::Established;
                    self.shared.lock().crypting = false;
                    return Ok(());
                }
                LinkStep::PassThrough(bytes) if !bytes.is_empty() => {
                    self.transport.write(WRITE_UUID, &bytes).await?;
                    log::info!("Sent authentication data: {}", hex::encode(&bytes));
                }
                LinkStep::PassThrough(_) | LinkStep::Again => {
                    log::debug!("Handshake step pending");
                }
            }
        }

        session.handshake = HandshakeState::Failed;
        log::warn!("No authentication data received, disconnecting");
        Err(Error::HandshakeFailed)
    }

    /// Write the pack selector and return the echoed pack number.
    async fn select_pack(&self, pack: u8) -> Result<u16, Error> {
        let command = self.device.build_pack_select(pack)?;
        let response = self.send_and_await(&command).await?;
        let body = command.parse_response(&response)?;
        log::debug!("Raw data set: {}", hex::encode(&body));
        if body.len() != 2 {
            return Err(Error::Parse(format!("unexpected echo length {}", body.len())));
        }
        Ok(u16::from_be_bytes([body[0], body[1]]))
    }

    async fn execute_command(
        &self,
        command: &DeviceCommand,
    ) -> Result<HashMap<String, FieldValue>, Error> {
        let response = self.send_and_await(command).await?;
        let body = command.parse_response(&response)?;
        log::debug!("Raw data: {}", hex::encode(&body));
        let parsed = self.device.parse(command.starting_address(), &body);
        log::debug!("Parsed data: {parsed:?}");
        Ok(parsed)
    }

    /// Write one command frame and suspend until its response arrives, a
    /// protocol error is detected, or the command timeout elapses.
    async fn send_and_await(&self, command: &DeviceCommand) -> Result<Vec<u8>, Error> {
        log::debug!("Requesting {command}");
        let (receiver, frame) = {
            let mut link = self.shared.lock();
            let frame = link.encode_frame(command.frame())?;
            let receiver = link.arm(Some(command.clone()), false);
            (receiver, frame)
        };
        log::trace!("Write frame: {}", hex::encode(&frame));
        self.transport.write(WRITE_UUID, &frame).await?;

        match tokio::time::timeout(self.response_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::BadConnection("notification channel closed".into())),
            Err(_) => {
                self.shared.lock().disarm();
                Err(Error::Timeout)
            }
        }
    }

    /// Best-effort unsubscribe and disconnect; errors are swallowed.
    async fn teardown(&self, session: &mut Session) {
        if session.has_notifier {
            if let Err(err) = self.transport.unsubscribe(NOTIFY_UUID).await {
                // Ignore errors here
                log::debug!("Unsubscribe failed: {err}");
            }
            session.has_notifier = false;
        }
        if let Err(err) = self.transport.disconnect().await {
            log::debug!("Disconnect failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::PlainLink;
    use crate::fields::DeviceStruct;
    use crate::transport::{Advertisement, NotificationCallback, ENCRYPTION_MARKER};
    use std::collections::VecDeque;

    fn read(starting_address: u16, quantity: u16) -> DeviceCommand {
        DeviceCommand::read_holding_registers(starting_address, quantity).unwrap()
    }

    fn read_response(values: &[u16]) -> Vec<u8> {
        let mut frame = vec![0x01, 0x03, (values.len() * 2) as u8];
        for value in values {
            frame.extend_from_slice(&value.to_be_bytes());
        }
        let crc = crc16::State::<crc16::MODBUS>::calculate(&frame).to_le_bytes();
        frame.extend_from_slice(&crc);
        frame
    }

    struct TestDevice {
        fields: DeviceStruct,
        polling: Vec<DeviceCommand>,
        pack_polling: Vec<DeviceCommand>,
        pack_num_address: Option<u16>,
        pack_num_max: u8,
    }

    impl TestDevice {
        fn battery_percent() -> Arc<Self> {
            let mut fields = DeviceStruct::new();
            fields.add_uint_field("total_battery_percent", 102);
            Arc::new(Self {
                fields,
                polling: vec![read(102, 1)],
                pack_polling: Vec::new(),
                pack_num_address: None,
                pack_num_max: 1,
            })
        }

        fn with_packs() -> Arc<Self> {
            let mut fields = DeviceStruct::new();
            fields.add_uint_field("total_battery_percent", 102);
            fields.add_uint_field("pack_battery_percent", 91);
            Arc::new(Self {
                fields,
                polling: vec![read(102, 1)],
                pack_polling: vec![read(91, 1)],
                pack_num_address: Some(3006),
                pack_num_max: 3,
            })
        }
    }

    impl BluettiDevice for TestDevice {
        fn device_type(&self) -> &str {
            "Test"
        }

        fn serial_number(&self) -> &str {
            "1234567890"
        }

        fn polling_commands(&self) -> Vec<DeviceCommand> {
            self.polling.clone()
        }

        fn pack_polling_commands(&self) -> Vec<DeviceCommand> {
            self.pack_polling.clone()
        }

        fn pack_num_max(&self) -> u8 {
            self.pack_num_max
        }

        fn pack_num_address(&self) -> Option<u16> {
            self.pack_num_address
        }

        fn read_sn_commands(&self) -> Vec<DeviceCommand> {
            vec![read(116, 4)]
        }

        fn parse(&self, starting_address: u16, body: &[u8]) -> HashMap<String, FieldValue> {
            self.fields.parse(starting_address, body)
        }
    }

    type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

    #[derive(Default)]
    struct TransportState {
        callback: Option<Arc<NotificationCallback>>,
        connected: bool,
        connect_attempts: u32,
        connect_failures: u32,
        disconnects: u32,
        writes: Vec<Vec<u8>>,
        subscriptions: u32,
        unsubscribes: u32,
    }

    struct TestTransport {
        state: Mutex<TransportState>,
        responder: Responder,
        adverts: Vec<Advertisement>,
    }

    impl TestTransport {
        fn new(responder: Responder) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::default(),
                responder,
                adverts: vec![Advertisement {
                    name: Some("Test1234567890".to_string()),
                    ..Default::default()
                }],
            })
        }

        fn with_encryption_marker(responder: Responder) -> Arc<Self> {
            let mut advertisement = Advertisement {
                name: Some("Test1234567890".to_string()),
                ..Default::default()
            };
            advertisement
                .manufacturer_data
                .insert(0x0590, ENCRYPTION_MARKER.to_vec());
            Arc::new(Self {
                state: Mutex::default(),
                responder,
                adverts: vec![advertisement],
            })
        }

        fn fail_connects(self: &Arc<Self>, failures: u32) -> Arc<Self> {
            self.state.lock().connect_failures = failures;
            Arc::clone(self)
        }

        fn push(&self, data: Vec<u8>) {
            let callback = self.state.lock().callback.clone();
            if let Some(callback) = callback {
                callback(data);
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for TestTransport {
        async fn discover(&self, _timeout: Duration) -> Result<Vec<Advertisement>, Error> {
            Ok(self.adverts.clone())
        }

        async fn connect(&self) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.connect_attempts <= state.connect_failures {
                return Err(Error::Connection("simulated connect failure".into()));
            }
            state.connected = true;
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.connected = false;
            state.disconnects += 1;
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.state.lock().connected
        }

        async fn write(&self, _characteristic: &str, data: &[u8]) -> Result<(), Error> {
            self.state.lock().writes.push(data.to_vec());
            let chunks = (self.responder)(data);
            let callback = self.state.lock().callback.clone();
            if let Some(callback) = callback {
                for chunk in chunks {
                    callback(chunk);
                }
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            _characteristic: &str,
            callback: NotificationCallback,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.subscriptions += 1;
            state.callback = Some(Arc::new(callback));
            Ok(())
        }

        async fn unsubscribe(&self, _characteristic: &str) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.unsubscribes += 1;
            state.callback = None;
            Ok(())
        }
    }

    fn requested_address(frame: &[u8]) -> u16 {
        u16::from_be_bytes([frame[2], frame[3]])
    }

    fn battery_responder() -> Responder {
        Box::new(|frame| {
            if frame[1] == 0x03 && requested_address(frame) == 102 {
                vec![read_response(&[87])]
            } else {
                Vec::new()
            }
        })
    }

    #[tokio::test]
    async fn poll_returns_decoded_snapshot() {
        let transport = TestTransport::new(battery_responder());
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        let data = reader.poll(None).await.expect("snapshot");
        assert_eq!(data.len(), 1);
        assert_eq!(
            data.get("total_battery_percent"),
            Some(&FieldValue::Uint(87))
        );

        // Teardown ran: unsubscribed and disconnected.
        let state = transport.state.lock();
        assert_eq!(state.subscriptions, 1);
        assert_eq!(state.unsubscribes, 1);
        assert!(!state.connected);
    }

    #[tokio::test]
    async fn poll_is_idempotent() {
        let transport = TestTransport::new(battery_responder());
        let reader = DeviceReader::new(
            transport,
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        let first = reader.poll(None).await.expect("snapshot");
        let second = reader.poll(None).await.expect("snapshot");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupted_checksum_yields_no_data() {
        let transport = TestTransport::new(Box::new(|frame| {
            if frame[1] == 0x03 && requested_address(frame) == 102 {
                let mut response = read_response(&[87]);
                *response.last_mut().unwrap() ^= 0x01;
                vec![response]
            } else {
                Vec::new()
            }
        }));
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        assert!(reader.poll(None).await.is_none());
        // Teardown still ran.
        assert!(!transport.state.lock().connected);
    }

    #[tokio::test]
    async fn response_split_over_notifications_is_reassembled() {
        let transport = TestTransport::new(Box::new(|frame| {
            if frame[1] == 0x03 && requested_address(frame) == 102 {
                let response = read_response(&[87]);
                let (head, tail) = response.split_at(3);
                vec![head.to_vec(), tail.to_vec()]
            } else {
                Vec::new()
            }
        }));
        let reader = DeviceReader::new(
            transport,
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        let data = reader.poll(None).await.expect("snapshot");
        assert_eq!(
            data.get("total_battery_percent"),
            Some(&FieldValue::Uint(87))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn modbus_exception_skips_field_only() {
        let mut fields = DeviceStruct::new();
        fields.add_uint_field("total_battery_percent", 102);
        fields.add_uint_field("dc_output_power", 140);
        let device = Arc::new(TestDevice {
            fields,
            polling: vec![read(102, 1), read(140, 1)],
            pack_polling: Vec::new(),
            pack_num_address: None,
            pack_num_max: 1,
        });
        let transport = TestTransport::new(Box::new(|frame| {
            match requested_address(frame) {
                102 => vec![vec![0x01, 0x83, 0x02, 0x00, 0x00]],
                140 => vec![read_response(&[120])],
                _ => Vec::new(),
            }
        }));
        let reader = DeviceReader::new(transport, device, Box::new(PlainLink));

        let data = reader.poll(None).await.expect("snapshot");
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("dc_output_power"), Some(&FieldValue::Uint(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_success() {
        let transport = TestTransport::new(battery_responder()).fail_connects(4);
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        let start = tokio::time::Instant::now();
        let data = reader.poll(None).await;
        assert!(data.is_some());
        assert_eq!(transport.state.lock().connect_attempts, 5);
        // Four failures spaced by the 2 second retry delay.
        assert!(start.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_surfaces_after_max_retries() {
        let transport = TestTransport::new(battery_responder()).fail_connects(u32::MAX);
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(PlainLink),
        );

        assert!(reader.poll(None).await.is_none());
        assert_eq!(transport.state.lock().connect_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_bounds_the_cycle() {
        // No responder: every command runs into its 5 second timeout, and
        // with 20 commands the 45 second polling timeout fires first.
        let device = Arc::new(TestDevice {
            fields: DeviceStruct::new(),
            polling: (0..20).map(|i| read(100 + i, 1)).collect(),
            pack_polling: Vec::new(),
            pack_num_address: None,
            pack_num_max: 1,
        });
        let transport = TestTransport::new(Box::new(|_| Vec::new()));
        let reader = DeviceReader::new(transport.clone(), device, Box::new(PlainLink));

        let start = tokio::time::Instant::now();
        assert!(reader.poll(None).await.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(45) && elapsed < Duration::from_secs(50));
        // Teardown still ran.
        assert!(!transport.state.lock().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn pack_polling_drops_zero_fields() {
        let selected = Arc::new(Mutex::new(0u8));
        let responder_selected = Arc::clone(&selected);
        let transport = TestTransport::new(Box::new(move |frame| {
            match (frame[1], requested_address(frame)) {
                (0x06, 3006) => {
                    *responder_selected.lock() = frame[5];
                    vec![frame.to_vec()]
                }
                (0x03, 102) => vec![read_response(&[87])],
                (0x03, 91) => {
                    let percent = match *responder_selected.lock() {
                        1 => 5,
                        3 => 7,
                        _ => 0,
                    };
                    vec![read_response(&[percent])]
                }
                _ => Vec::new(),
            }
        }));
        let reader = DeviceReader::new(transport, TestDevice::with_packs(), Box::new(PlainLink));

        let data = reader.poll(None).await.expect("snapshot");
        assert_eq!(
            data.get("total_battery_percent"),
            Some(&FieldValue::Uint(87))
        );
        assert_eq!(data.get("pack_battery_percent1"), Some(&FieldValue::Uint(5)));
        assert_eq!(data.get("pack_battery_percent2"), None);
        assert_eq!(data.get("pack_battery_percent3"), Some(&FieldValue::Uint(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn filter_skips_pack_polling() {
        let transport = TestTransport::new(battery_responder());
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::with_packs(),
            Box::new(PlainLink),
        );

        let filter = [read(102, 1)];
        let data = reader.poll(Some(&filter)).await.expect("snapshot");
        assert_eq!(data.len(), 1);
        // No pack selector writes happened.
        assert!(transport
            .state
            .lock()
            .writes
            .iter()
            .all(|frame| frame[1] != 0x06));
    }

    #[tokio::test(start_paused = true)]
    async fn pack_select_mismatch_skips_pack() {
        let transport = TestTransport::new(Box::new(|frame| {
            match (frame[1], requested_address(frame)) {
                // Echo always claims pack 1 regardless of the request.
                (0x06, 3006) => {
                    let mut echo = frame.to_vec();
                    echo[5] = 1;
                    let crc =
                        crc16::State::<crc16::MODBUS>::calculate(&echo[..6]).to_le_bytes();
                    echo[6] = crc[0];
                    echo[7] = crc[1];
                    vec![echo]
                }
                (0x03, 102) => vec![read_response(&[87])],
                (0x03, 91) => vec![read_response(&[9])],
                _ => Vec::new(),
            }
        }));
        let reader = DeviceReader::new(transport, TestDevice::with_packs(), Box::new(PlainLink));

        let data = reader.poll(None).await.expect("snapshot");
        // Only pack 1 was accepted; packs 2 and 3 echoed the wrong number.
        assert_eq!(data.get("pack_battery_percent1"), Some(&FieldValue::Uint(9)));
        assert_eq!(data.get("pack_battery_percent2"), None);
        assert_eq!(data.get("pack_battery_percent3"), None);
    }

    struct ScriptedCrypto {
        steps: VecDeque<LinkStep>,
    }

    impl ScriptedCrypto {
        fn new(steps: Vec<LinkStep>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl LinkCrypto for ScriptedCrypto {
        fn version(&self) -> String {
            String::from("scripted")
        }

        fn negotiate_link(&mut self, _data: &[u8]) -> LinkStep {
            self.steps.pop_front().unwrap_or(LinkStep::Again)
        }

        fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(data.to_vec())
        }

        fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(data.to_vec())
        }
    }

    /// Pushes a handshake challenge once a second, the way a device keeps
    /// nudging an unauthorized client.
    fn spawn_challenge_pusher(transport: Arc<TestTransport>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                transport.push(vec![0xaa, 0x55]);
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_establishes_after_serial_exchange() {
        let transport = TestTransport::with_encryption_marker(battery_responder());
        let crypto = ScriptedCrypto::new(vec![LinkStep::SendSerial, LinkStep::Established]);
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(crypto),
        );
        spawn_challenge_pusher(transport.clone());

        let data = reader.poll(None).await.expect("snapshot");
        assert_eq!(
            data.get("total_battery_percent"),
            Some(&FieldValue::Uint(87))
        );

        // Exactly one serial-read frame went out during the handshake.
        let sn_frame = read(116, 4).frame().to_vec();
        let state = transport.state.lock();
        assert_eq!(
            state.writes.iter().filter(|w| **w == sn_frame).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_forwards_pass_through_payload() {
        let transport = TestTransport::with_encryption_marker(battery_responder());
        let crypto = ScriptedCrypto::new(vec![
            LinkStep::PassThrough(vec![0xde, 0xad]),
            LinkStep::Established,
        ]);
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(crypto),
        );
        spawn_challenge_pusher(transport.clone());

        assert!(reader.poll(None).await.is_some());
        assert!(transport
            .state
            .lock()
            .writes
            .iter()
            .any(|w| w == &vec![0xde, 0xad]));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_fails_after_bounded_attempts() {
        let transport = TestTransport::with_encryption_marker(battery_responder());
        let crypto = ScriptedCrypto::new(Vec::new());
        let reader = DeviceReader::new(
            transport.clone(),
            TestDevice::battery_percent(),
            Box::new(crypto),
        );
        spawn_challenge_pusher(transport.clone());

        assert!(reader.poll(None).await.is_none());
        assert_eq!(reader.handshake_state().await, HandshakeState::Failed);

        let state = transport.state.lock();
        // The link was torn down and no register read ever went out.
        assert!(state.disconnects >= 1);
        assert!(state.unsubscribes >= 1);
        assert!(!state.connected);
        assert!(state.writes.is_empty());
    }

    #[test]
    fn unexpected_notification_is_ignored() {
        let mut link = LinkState::new(Box::new(PlainLink));
        link.handle_notification(vec![0x01, 0x03, 0x02]);
        assert!(link.response.is_empty());
        assert!(link.waiter.is_none());
    }

    #[test]
    fn at_command_echo_resolves_bad_connection() {
        let mut link = LinkState::new(Box::new(PlainLink));
        let mut receiver = link.arm(Some(read(102, 1)), false);
        link.handle_notification(b"AT+NAME?\r".to_vec());
        assert!(matches!(
            receiver.try_recv().unwrap(),
            Err(Error::BadConnection(_))
        ));
    }

    #[test]
    fn exception_frame_resolves_modbus_error() {
        let mut link = LinkState::new(Box::new(PlainLink));
        let mut receiver = link.arm(Some(read(102, 1)), false);
        link.handle_notification(vec![0x01, 0x83, 0x02, 0x00, 0x00]);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            Err(Error::ModbusException(2))
        ));
    }

    #[test]
    fn partial_frame_keeps_waiting() {
        let mut link = LinkState::new(Box::new(PlainLink));
        let mut receiver = link.arm(Some(read(102, 1)), false);
        let response = read_response(&[87]);
        let (head, tail) = response.split_at(2);
        link.handle_notification(head.to_vec());
        assert!(receiver.try_recv().is_err());
        link.handle_notification(tail.to_vec());
        assert_eq!(receiver.try_recv().unwrap().unwrap(), response);
    }
}
