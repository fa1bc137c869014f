//! Network controller firmware: runs the locker and mirrors its state over MQTT.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::{
    boxed::Box,
    string::{String, ToString},
};
use anyhow::Result;
use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};
use embassy_executor::Spawner;
use embassy_futures::select::{self, Either};
use embassy_net::{DhcpConfig, Runner, Stack, StackResources};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, signal::Signal};
use embassy_time::{Duration, Instant, Timer};
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{
    interrupt::software::SoftwareInterruptControl, peripherals::WIFI, rng::Rng,
    timer::timg::TimerGroup,
};
use esp_println::logger;
use esp_radio::{
    Controller as RadioController,
    wifi::{
        self, ClientConfig, CountryInfo, ModeConfig, OperatingClass, WifiController, WifiDevice,
        WifiEvent,
    },
};
use log::{error, info, warn};
use mcutie::{
    McutieBuilder, McutieReceiver, McutieTask, MqttMessage, PublishBytes, Publishable, Topic,
    homeassistant::AvailabilityState,
};
use parcelbox::{
    clock::Clock,
    config::Config,
    controller::Controller,
    frame::LockId,
    mirror::{Connectivity, Mirror, MirrorSync, Path},
    scan::{Debouncer, ScanRequest, Scanner},
};
use parcelbox_home::{ArduinoPort, EmbassyClock, QrScanner, StatusLed};
use static_cell::StaticCell;

// Delay between Wi-Fi reconnection attempts
const WIFI_RETRY_DELAY: Duration = Duration::from_secs(5);

// Pause after a failed control loop tick
const CONTROL_RETRY_DELAY: Duration = Duration::from_secs(1);

// Delay between homing attempts while the actuator controller is not answering
const HOME_RETRY_DELAY: Duration = Duration::from_secs(10);

/// MQTT topic used to report locker availability
const STATUS_TOPIC: Topic<&str> = Topic::Device("status");

/// MQTT topic carrying configuration updates
const CONFIG_TOPIC: Topic<&str> = Topic::Device("config");

/// MQTT topic carrying reset requests, the payload is the lock number
const RESET_TOPIC: Topic<&str> = Topic::Device("reset");

static MQTT_CONNECTED: AtomicBool = AtomicBool::new(false);
static WIFI_RECONNECT: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static CONFIG_UPDATES: Channel<CriticalSectionRawMutex, String, 2> = Channel::new();
static SCANS: Channel<CriticalSectionRawMutex, ScanRequest, 4> = Channel::new();
static RESETS: Channel<CriticalSectionRawMutex, LockId, 2> = Channel::new();

esp_bootloader_esp_idf::esp_app_desc!();

/// Publishes mirror records below the device topic, e.g. `<device>/locks_status`.
struct MqttMirror;

impl Mirror for MqttMirror {
    type Error = mcutie::Error;

    async fn publish(&mut self, path: Path, payload: &str) -> Result<(), Self::Error> {
        let name = path.as_ref().trim_start_matches('/').to_string();

        Topic::Device(name).with_display(payload).publish().await
    }

    async fn next_update(&mut self, path: Path) -> Option<String> {
        match path {
            Path::Config => CONFIG_UPDATES.try_receive().ok(),
            _ => None,
        }
    }
}

struct MqttConnectivity;

impl Connectivity for MqttConnectivity {
    fn is_connected(&self) -> bool {
        MQTT_CONNECTED.load(Ordering::Relaxed)
    }

    fn reconnect(&mut self) {
        WIFI_RECONNECT.signal(());
    }
}

#[embassy_executor::task]
async fn mqtt_stack_task(
    task: McutieTask<
        'static,
        &'static str,
        PublishBytes<'static, &'static str, AvailabilityState>,
        2,
    >,
) {
    // Move large MQTT task to heap
    Box::pin(task.run()).await;
}

#[embassy_executor::task]
async fn mqtt_message_task(receiver: McutieReceiver, mut led: StatusLed<'static>) -> ! {
    loop {
        match receiver.receive().await {
            MqttMessage::Connected => {
                info!("MQTT connected");
                MQTT_CONNECTED.store(true, Ordering::Relaxed);

                if let Err(err) = STATUS_TOPIC
                    .with_bytes(&AvailabilityState::Online)
                    .publish()
                    .await
                {
                    error!("Failed to publish status: {err:?}");
                }
            }
            MqttMessage::Disconnected => {
                info!("MQTT disconnected");
                MQTT_CONNECTED.store(false, Ordering::Relaxed);
            }
            MqttMessage::Publish(Topic::Device(topic), payload) if topic == "reset" => {
                let id = str::from_utf8(&payload)
                    .ok()
                    .and_then(|id| id.trim().parse::<LockId>().ok());

                match id {
                    Some(id) => {
                        if RESETS.try_send(id).is_err() {
                            warn!("Dropping reset of {id}, previous requests still pending");
                        }
                    }
                    None => warn!("Ignoring reset request for an unknown lock"),
                }
            }
            MqttMessage::Publish(Topic::Device(topic), payload) if topic == "config" => {
                match str::from_utf8(&payload) {
                    Ok(update) => {
                        if CONFIG_UPDATES.try_send(update.to_string()).is_err() {
                            warn!("Dropping configuration update, previous one still pending");
                        }
                    }
                    Err(err) => warn!("Ignoring non-UTF-8 configuration update: {err}"),
                }
            }
            _ => {}
        }

        led.set_connected(MQTT_CONNECTED.load(Ordering::Relaxed));
    }
}

#[embassy_executor::task]
async fn qr_task(mut scanner: QrScanner<'static>) -> ! {
    let clock = EmbassyClock;
    let mut debouncer = Debouncer::new();

    loop {
        let Some(code) = scanner.read_qr().await else {
            continue;
        };

        if !debouncer.accept(&code, clock.now()) {
            continue;
        }

        match ScanRequest::parse(&code) {
            Some(req) => {
                info!("Scanned {} {} for {}", req.kind, req.reference, req.lock);
                SCANS.send(req).await;
            }
            None => warn!("Ignoring unknown code {code:?}"),
        }
    }
}

#[embassy_executor::task]
async fn control_task(port: ArduinoPort<'static>) -> ! {
    let config = Config::default();
    let mut ctrl = Controller::new(port, EmbassyClock, config);
    let mut sync = MirrorSync::new(MqttMirror, MqttConnectivity, &config);

    let mut next_home = Instant::now();

    loop {
        // Actuator controller may boot later than this one
        if !ctrl.is_homed() && Instant::now() >= next_home {
            next_home = Instant::now() + HOME_RETRY_DELAY;

            if let Err(err) = ctrl.home().await {
                error!("Failed to home locks: {err:?}");
            }
        }

        if let Err(err) = ctrl.tick().await {
            error!("Control loop tick failed: {err:?}");
            Timer::after(CONTROL_RETRY_DELAY).await;
        }

        while let Ok(id) = RESETS.try_receive() {
            match ctrl.reset(id).await {
                Ok(()) => info!("Reset {id}"),
                Err(err) => warn!("Failed to reset {id}: {err:?}"),
            }
        }

        while let Ok(req) = SCANS.try_receive() {
            if let Err(err) = ctrl.begin(req.lock, req.kind, req.reference) {
                warn!("Refusing {} on {}: {err:?}", req.kind, req.lock);
            }
        }

        while let Some(record) = ctrl.next_record() {
            sync.push(record);
        }

        sync.sync(ctrl.now()).await;

        if let Some(update) = sync.poll_config().await {
            ctrl.apply_config(&update);
        }
    }
}

#[embassy_executor::task]
async fn network_stack_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await;
}

#[embassy_executor::task]
async fn wifi_connect_task(mut controller: WifiController<'static>) -> ! {
    loop {
        match controller.connect_async().await {
            Ok(()) => {
                info!("Wi-Fi connected");
                controller.wait_for_event(WifiEvent::StaDisconnected).await;
                info!("Wi-Fi disconnected");
            }
            Err(err) => {
                error!("Failed to connect to Wi-Fi: {err:?}");

                // Retry early if the mirror asks for it
                if let Either::Second(()) = select::select(
                    Timer::after(WIFI_RETRY_DELAY),
                    WIFI_RECONNECT.wait(),
                )
                .await
                {
                    info!("Reconnection requested");
                }
            }
        }
    }
}

fn init_wifi(wifi: WIFI<'static>) -> Result<(WifiController<'static>, WifiDevice<'static>)> {
    static CONTROLLER: StaticCell<RadioController<'_>> = StaticCell::new();

    let controller = CONTROLLER.init(
        esp_radio::init().map_err(|err| anyhow::anyhow!("Failed to initialize radio: {err:?}"))?,
    );
    let (mut controller, intfs) = wifi::new(
        controller,
        wifi,
        wifi::Config::default().with_country_code(
            CountryInfo::from(*b"01").with_operating_class(OperatingClass::Indoors),
        ),
    )
    .map_err(|err| anyhow::anyhow!("Failed to create Wi-Fi controller: {err:?}"))?;

    controller
        .set_config(&ModeConfig::Client(
            ClientConfig::default()
                .with_ssid(env!("WIFI_SSID").into())
                .with_password(env!("WIFI_PASSWORD").into()),
        ))
        .map_err(|err| anyhow::anyhow!("Failed to set Wi-Fi configuration: {err:?}"))?;
    controller
        .start()
        .map_err(|err| anyhow::anyhow!("Failed to start Wi-Fi controller: {err:?}"))?;

    Ok((controller, intfs.sta))
}

fn hostname_from_wifi(dev: &WifiDevice<'_>) -> Result<String> {
    let mut hostname = String::with_capacity(32);

    write!(&mut hostname, "parcelbox_")?;

    for byte in dev.mac_address() {
        write!(&mut hostname, "{byte:02x}")?;
    }

    Ok(hostname)
}

fn init_network(
    dev: WifiDevice<'static>,
    hostname: &str,
) -> Result<(Stack<'static>, Runner<'static, WifiDevice<'static>>)> {
    static RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

    let resources = RESOURCES.init(StackResources::new());
    let rng = Rng::new();
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let mut cfg = DhcpConfig::default();

    cfg.hostname = Some(
        hostname
            .try_into()
            .map_err(|err| anyhow::anyhow!("Failed to set DHCP hostname: {err:?}"))?,
    );

    Ok(embassy_net::new(
        dev,
        embassy_net::Config::dhcpv4(cfg),
        resources,
        seed,
    ))
}

#[esp_rtos::main]
async fn main(spawner: Spawner) {
    logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_alloc::heap_allocator!(size: 128 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);

    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    let port = parcelbox_home::new_arduino_port(peripherals.UART1).unwrap();
    let scanner = parcelbox_home::new_qr_scanner(peripherals.UART0).unwrap();
    let led = parcelbox_home::new_status_led();
    let (wifi_controller, wifi_dev) = init_wifi(peripherals.WIFI).unwrap();
    let hostname = hostname_from_wifi(&wifi_dev).unwrap();
    let (net_stack, net_runner) = init_network(wifi_dev, &hostname).unwrap();
    let (mqtt_receiver, mqtt_task) =
        McutieBuilder::new(net_stack, "parcelbox", env!("MQTT_HOSTNAME"))
            .with_authentication(env!("MQTT_USERNAME"), env!("MQTT_PASSWORD"))
            .with_subscriptions([CONFIG_TOPIC, RESET_TOPIC])
            .with_last_will(STATUS_TOPIC.with_bytes(AvailabilityState::Offline))
            .build();

    info!("Starting locker {hostname}");

    spawner.spawn(mqtt_stack_task(mqtt_task)).unwrap();
    spawner.spawn(mqtt_message_task(mqtt_receiver, led)).unwrap();
    spawner.spawn(network_stack_task(net_runner)).unwrap();
    spawner.spawn(wifi_connect_task(wifi_controller)).unwrap();
    spawner.spawn(control_task(port)).unwrap();
    spawner.spawn(qr_task(scanner)).unwrap();
}
