//! Session supervisor for `omron-env-mqtt`.
//!
//! Owns the one radio for the whole process: resets and configures it once,
//! runs a single advertisement reader, and fans matching frames out to one
//! decode/publish pipeline per watched device. Whatever ends the session
//! (signal, reader error), scanning is disabled and the event filter restored
//! before returning.
//!
//! Decoupled from the real radio and broker so it can be tested
//! deterministically.

use crate::config::Options;
use crate::decoder;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::mac_address::MacAddress;
use crate::publisher::{MqttPublisher, Publish, publish_reading};
use crate::scanner::hci::HciRadio;
use crate::scanner::{FrameResult, Radio, RawAdvertisement, ScanError};
use std::collections::BTreeSet;
use std::future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings for one supervised session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub devices: BTreeSet<MacAddress>,
    pub base_topic: String,
    /// Silence after which the radio is reported as possibly stalled
    pub watchdog: Option<Duration>,
}

impl From<&Options> for SessionConfig {
    fn from(options: &Options) -> Self {
        Self {
            devices: options.watched_devices(),
            base_topic: options.base_topic.clone(),
            watchdog: options.watchdog(),
        }
    }
}

/// Errors returned by the supervisor.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// HCI events read from the radio
    pub frames: u64,
    /// Events from a watched device handed to its pipeline
    pub matched: u64,
    /// Events from a watched device lost because its pipeline was full
    pub dropped: u64,
    pub decode_failures: u64,
    pub published: u64,
    pub publish_failures: u64,
    /// Watchdog periods that passed without any HCI event
    pub stalls: u64,
}

impl SessionStats {
    fn absorb(&mut self, other: SessionStats) {
        self.frames += other.frames;
        self.matched += other.matched;
        self.dropped += other.dropped;
        self.decode_failures += other.decode_failures;
        self.published += other.published;
        self.publish_failures += other.publish_failures;
        self.stalls += other.stalls;
    }
}

/// Run against the hci adapter and MQTT broker named in `options` until
/// `cancel` fires or the radio fails.
///
/// `options` must already have passed [`Options::validate`].
pub async fn run(options: Options, cancel: CancellationToken) -> Result<SessionStats, RunError> {
    let config = SessionConfig::from(&options);

    let mut radio = HciRadio::new(options.adapter);
    let publisher = Arc::new(MqttPublisher::connect(&options.mqtt));

    let result = run_session(&config, &mut radio, publisher.clone(), cancel).await;

    // every pipeline has finished, so this is the last reference
    match Arc::try_unwrap(publisher) {
        Ok(publisher) => publisher.shutdown().await,
        Err(_) => warn!("MQTT client still in use at shutdown"),
    }

    result
}

/// Drive one session on `radio`, publishing through `publisher`.
///
/// Setup order is reset, open, event filter, scan parameters, scan enable.
/// A reset or open failure is returned immediately; any later failure, and
/// every normal exit, releases the radio first.
pub async fn run_session(
    config: &SessionConfig,
    radio: &mut dyn Radio,
    publisher: Arc<dyn Publish>,
    cancel: CancellationToken,
) -> Result<SessionStats, RunError> {
    radio.reset()?;
    radio.open()?;

    if let Err(e) = start_scanning(radio) {
        release(radio, false);
        return Err(e.into());
    }
    info!("Scanning on hci{}", radio.dev_id());

    let reader_cancel = cancel.child_token();
    let frames = match radio.start_reader(reader_cancel.clone()) {
        Ok(frames) => frames,
        Err(e) => {
            release(radio, true);
            return Err(e.into());
        }
    };

    let mut dispatcher = Dispatcher::new();
    let mut pipelines = Vec::with_capacity(config.devices.len());
    for &address in &config.devices {
        let rx = dispatcher.register(address);
        pipelines.push(tokio::spawn(run_pipeline(
            address,
            rx,
            Arc::clone(&publisher),
            config.base_topic.clone(),
        )));
        info!("Listening for device {}", address);
    }

    let mut stats = SessionStats::default();
    let outcome = read_loop(
        frames,
        &dispatcher,
        &cancel,
        config.watchdog,
        radio.dev_id(),
        &mut stats,
    )
    .await;

    reader_cancel.cancel();
    release(radio, true);

    // closing the routes lets each pipeline drain and finish
    drop(dispatcher);
    for pipeline in pipelines {
        match pipeline.await {
            Ok(pipeline_stats) => stats.absorb(pipeline_stats),
            Err(e) => warn!("Device pipeline failed: {}", e),
        }
    }

    info!(
        frames = stats.frames,
        matched = stats.matched,
        dropped = stats.dropped,
        decode_failures = stats.decode_failures,
        published = stats.published,
        publish_failures = stats.publish_failures,
        stalls = stats.stalls,
        "Session finished"
    );

    outcome.map(|()| stats).map_err(RunError::from)
}

fn start_scanning(radio: &mut dyn Radio) -> Result<(), ScanError> {
    radio.install_event_filter()?;
    radio.set_scan_parameters()?;
    radio.enable_scan()
}

/// Undo `start_scanning`. Failures are logged; the session is ending anyway.
fn release(radio: &mut dyn Radio, scanning: bool) {
    if scanning && let Err(e) = radio.disable_scan() {
        warn!("Failed to disable scanning on hci{}: {}", radio.dev_id(), e);
    }
    if let Err(e) = radio.restore_event_filter() {
        warn!("Failed to restore event filter on hci{}: {}", radio.dev_id(), e);
    }
}

/// Pull frames from the reader and route them until cancelled, the reader
/// reports an error, or the reader goes away.
async fn read_loop(
    mut frames: mpsc::Receiver<FrameResult>,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    watchdog: Option<Duration>,
    dev_id: u16,
    stats: &mut SessionStats,
) -> Result<(), ScanError> {
    let mut last_frame = Instant::now();

    loop {
        let deadline = watchdog.map(|period| last_frame + period);
        let silence = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested");
                return Ok(());
            }
            frame = frames.recv() => match frame {
                Some(Ok(frame)) => {
                    last_frame = Instant::now();
                    stats.frames += 1;
                    match dispatcher.dispatch(frame) {
                        Dispatch::Routed => stats.matched += 1,
                        Dispatch::Dropped => stats.dropped += 1,
                        Dispatch::Unwatched => {}
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    info!("Advertisement reader stopped");
                    return Ok(());
                }
            },
            _ = silence => {
                stats.stalls += 1;
                warn!(
                    "No HCI events from hci{} for {}s, the radio may be stalled",
                    dev_id,
                    watchdog.unwrap_or_default().as_secs()
                );
                last_frame = Instant::now();
            }
        }
    }
}

/// Decode and publish every frame routed to `address`, in arrival order.
async fn run_pipeline(
    address: MacAddress,
    mut frames: mpsc::Receiver<RawAdvertisement>,
    publisher: Arc<dyn Publish>,
    base_topic: String,
) -> SessionStats {
    let mut stats = SessionStats::default();

    while let Some(frame) = frames.recv().await {
        debug!("Received packet from {}", address);

        let reading = match decoder::decode(&frame.data, SystemTime::now()) {
            Ok(reading) => reading,
            Err(e) => {
                stats.decode_failures += 1;
                debug!("Discarding frame from {}: {}", address, e);
                continue;
            }
        };

        match publish_reading(publisher.as_ref(), &base_topic, &address, &reading) {
            Ok(()) => stats.published += 1,
            Err(e) => {
                stats.publish_failures += 1;
                warn!("Failed to publish reading for {}: {}", address, e);
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublishError;
    use crate::scanner::FRAME_CHANNEL_BUFFER_SIZE;
    use crate::test_utils::{TEST_MAC, bl_frame, bu_frame, frame_with_payload};
    use std::io;
    use std::sync::Mutex;

    const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const STRANGER_MAC: MacAddress = MacAddress([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

    enum Scripted {
        Frame(Vec<u8>),
        Fail,
    }

    /// Radio that records every call and replays scripted frames.
    #[derive(Default)]
    struct FakeRadio {
        calls: Vec<&'static str>,
        script: Vec<Scripted>,
        /// Keep the reader alive after the script until cancelled
        hold_open: bool,
        fail_on: Option<&'static str>,
    }

    impl FakeRadio {
        fn with_frames(frames: Vec<Vec<u8>>) -> Self {
            Self {
                script: frames.into_iter().map(Scripted::Frame).collect(),
                ..Self::default()
            }
        }

        fn call(&mut self, name: &'static str) -> Result<(), ScanError> {
            self.calls.push(name);
            if self.fail_on == Some(name) {
                let source = io::Error::other("injected failure");
                return Err(match name {
                    "reset" => ScanError::Reset { dev_id: 0, source },
                    "open" => ScanError::Open { dev_id: 0, source },
                    "install_event_filter" => ScanError::Filter(source),
                    _ => ScanError::Command { name, source },
                });
            }
            Ok(())
        }

        fn count(&self, name: &str) -> usize {
            self.calls.iter().filter(|call| **call == name).count()
        }
    }

    impl Radio for FakeRadio {
        fn dev_id(&self) -> u16 {
            0
        }

        fn reset(&mut self) -> Result<(), ScanError> {
            self.call("reset")
        }

        fn open(&mut self) -> Result<(), ScanError> {
            self.call("open")
        }

        fn install_event_filter(&mut self) -> Result<(), ScanError> {
            self.call("install_event_filter")
        }

        fn restore_event_filter(&mut self) -> Result<(), ScanError> {
            self.call("restore_event_filter")
        }

        fn set_scan_parameters(&mut self) -> Result<(), ScanError> {
            self.call("set_scan_parameters")
        }

        fn enable_scan(&mut self) -> Result<(), ScanError> {
            self.call("enable_scan")
        }

        fn disable_scan(&mut self) -> Result<(), ScanError> {
            self.call("disable_scan")
        }

        fn start_reader(
            &mut self,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
            self.call("start_reader")?;
            let script = std::mem::take(&mut self.script);
            let hold_open = self.hold_open;
            let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

            tokio::spawn(async move {
                for item in script {
                    let result = match item {
                        Scripted::Frame(data) => match RawAdvertisement::parse(&data) {
                            Some(frame) => Ok(frame),
                            None => continue,
                        },
                        Scripted::Fail => Err(ScanError::Read(io::Error::other("socket closed"))),
                    };
                    if tx.send(result).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    cancel.cancelled().await;
                }
            });

            Ok(rx)
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPublisher {
        fn messages(&self) -> Vec<(String, String)> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Publish for RecordingPublisher {
        fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn config(devices: &[MacAddress]) -> SessionConfig {
        SessionConfig {
            devices: devices.iter().copied().collect(),
            base_topic: "homeassistant/2jciebl-bu-ble".to_string(),
            watchdog: None,
        }
    }

    const FULL_SEQUENCE: [&str; 8] = [
        "reset",
        "open",
        "install_event_filter",
        "set_scan_parameters",
        "enable_scan",
        "start_reader",
        "disable_scan",
        "restore_event_filter",
    ];

    #[tokio::test]
    async fn test_run_publishes_bu_reading() {
        let mut radio = FakeRadio::with_frames(vec![bu_frame(TEST_MAC)]);
        let publisher = Arc::new(RecordingPublisher::default());

        let stats = run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].0,
            "homeassistant/2jciebl-bu-ble/aa_bb_cc_dd_ee_ff"
        );
        assert!(messages[0].1.contains(r#""temperature":"24.55""#));
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(radio.calls, FULL_SEQUENCE);
    }

    #[tokio::test]
    async fn test_run_ignores_unwatched_devices() {
        let mut radio = FakeRadio::with_frames(vec![bu_frame(STRANGER_MAC), bl_frame(STRANGER_MAC)]);
        let publisher = Arc::new(RecordingPublisher::default());

        let stats = run_session(
            &config(&[TEST_MAC, OTHER_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(publisher.messages().is_empty());
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.matched, 0);
    }

    #[tokio::test]
    async fn test_run_shares_one_radio_between_devices() {
        let mut radio = FakeRadio::with_frames(vec![
            bu_frame(TEST_MAC),
            bl_frame(OTHER_MAC),
            bu_frame(STRANGER_MAC),
            bl_frame(TEST_MAC),
        ]);
        let publisher = Arc::new(RecordingPublisher::default());

        let stats = run_session(
            &config(&[TEST_MAC, OTHER_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.published, 3);
        for call in ["reset", "open", "enable_scan", "disable_scan", "start_reader"] {
            assert_eq!(radio.count(call), 1, "{call} should happen exactly once");
        }

        let topics: Vec<String> = publisher.messages().into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics.iter().filter(|t| t.ends_with("aa_bb_cc_dd_ee_ff")).count(), 2);
        assert_eq!(topics.iter().filter(|t| t.ends_with("11_22_33_44_55_66")).count(), 1);
    }

    #[tokio::test]
    async fn test_run_preserves_order_per_device() {
        let frames = (0..10u8)
            .map(|seq| {
                let mut frame = bl_frame(TEST_MAC);
                frame[21] = seq;
                frame
            })
            .collect();
        let mut radio = FakeRadio::with_frames(frames);
        let publisher = Arc::new(RecordingPublisher::default());

        run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let sequence: Vec<String> = publisher
            .messages()
            .iter()
            .map(|(_, payload)| {
                let json: serde_json::Value = serde_json::from_str(payload).unwrap();
                json["sequence_number"].as_str().unwrap().to_string()
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|n: u8| n.to_string()).collect();
        assert_eq!(sequence, expected);
    }

    #[tokio::test]
    async fn test_run_counts_undecodable_frames() {
        let unknown = frame_with_payload(TEST_MAC, &[0x05, 0xFF, 0xD5, 0x02, 0x00, 0x00]);
        let foreign = frame_with_payload(TEST_MAC, &[0x05, 0xFF, 0x4C, 0x00, 0x02, 0x15]);
        let mut radio = FakeRadio::with_frames(vec![unknown, foreign]);
        let publisher = Arc::new(RecordingPublisher::default());

        let stats = run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(publisher.messages().is_empty());
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.decode_failures, 2);
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_reset_fails() {
        let mut radio = FakeRadio {
            fail_on: Some("reset"),
            ..FakeRadio::with_frames(vec![bu_frame(TEST_MAC)])
        };
        let publisher = Arc::new(RecordingPublisher::default());

        let result = run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::Reset { .. }))));
        assert_eq!(radio.calls, ["reset"]);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_run_restores_filter_when_setup_fails() {
        let mut radio = FakeRadio {
            fail_on: Some("set_scan_parameters"),
            ..FakeRadio::default()
        };
        let publisher = Arc::new(RecordingPublisher::default());

        let result = run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::Command { .. }))));
        assert_eq!(
            radio.calls,
            [
                "reset",
                "open",
                "install_event_filter",
                "set_scan_parameters",
                "restore_event_filter"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_disables_scan_after_reader_error() {
        let mut radio = FakeRadio {
            script: vec![Scripted::Frame(bu_frame(TEST_MAC)), Scripted::Fail],
            ..FakeRadio::default()
        };
        let publisher = Arc::new(RecordingPublisher::default());

        let result = run_session(
            &config(&[TEST_MAC]),
            &mut radio,
            publisher.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::Read(_)))));
        assert_eq!(radio.calls, FULL_SEQUENCE);
        // the frame read before the failure still goes out
        assert_eq!(publisher.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let mut radio = FakeRadio {
            hold_open: true,
            ..FakeRadio::with_frames(vec![bu_frame(TEST_MAC), bl_frame(OTHER_MAC)])
        };
        let publisher = Arc::new(RecordingPublisher::default());
        let cancel = CancellationToken::new();
        let config = config(&[TEST_MAC, OTHER_MAC]);

        let (result, ()) = tokio::join!(
            run_session(&config, &mut radio, publisher.clone(), cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        let stats = result.unwrap();
        assert_eq!(stats.published, 2);
        assert_eq!(radio.count("enable_scan"), 1);
        assert_eq!(radio.count("disable_scan"), 1);
        assert_eq!(radio.calls.last(), Some(&"restore_event_filter"));
    }

    async fn run_silent(watchdog: Option<Duration>, quiet_for: Duration) -> (SessionStats, FakeRadio) {
        let mut radio = FakeRadio {
            hold_open: true,
            ..FakeRadio::default()
        };
        let publisher = Arc::new(RecordingPublisher::default());
        let cancel = CancellationToken::new();
        let config = SessionConfig {
            watchdog,
            ..config(&[TEST_MAC])
        };

        let (result, ()) = tokio::join!(
            run_session(&config, &mut radio, publisher, cancel.clone()),
            async {
                tokio::time::sleep(quiet_for).await;
                cancel.cancel();
            }
        );
        (result.unwrap(), radio)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reports_silent_radio() {
        let (stats, radio) =
            run_silent(Some(Duration::from_secs(1)), Duration::from_millis(5500)).await;

        // one report per elapsed period, the session keeps running
        assert_eq!(stats.stalls, 5);
        assert_eq!(stats.frames, 0);
        assert_eq!(radio.count("disable_scan"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_disabled() {
        let (stats, radio) = run_silent(None, Duration::from_millis(5500)).await;

        assert_eq!(stats.stalls, 0);
        assert_eq!(radio.count("disable_scan"), 1);
    }

    #[test]
    fn test_session_config_from_options() {
        use clap::Parser;

        let options = Options::try_parse_from([
            "omron-env-mqtt",
            "-a",
            "AA:BB:CC:DD:EE:FF,aa:bb:cc:dd:ee:ff,11:22:33:44:55:66",
            "-t",
            "sensors",
            "--watchdog",
            "0",
        ])
        .unwrap();

        let config = SessionConfig::from(&options);
        assert_eq!(config.devices.len(), 2);
        assert!(config.devices.contains(&TEST_MAC));
        assert_eq!(config.base_topic, "sensors");
        assert_eq!(config.watchdog, None);
    }
}
