//! Relays the actuator link to USB, so `lockctl` and the console can run on a host.
//!
//! Only complete lines are relayed. Host lines that are not commands are
//! answered on the actuator's behalf, garbled actuator lines are dropped.
//! A failed write to the actuator is reported to the host as a system error.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::string::ToString;
use core::{panic::PanicInfo, time::Duration};
use embassy_executor::Spawner;
use embassy_futures::select::{self, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::TimeoutError;
use esp_alloc as _;
use esp_hal::{
    Async, Config, interrupt::software::SoftwareInterruptControl, timer::timg::TimerGroup,
    usb_serial_jtag::UsbSerialJtag,
};
use parcelbox::{
    clock::Clock,
    event::Event,
    frame::{Frame, Rejection},
    framer::Framer,
};
use parcelbox_home::{ArduinoPort, EmbassyClock, StatusLed};

// Longest wait before both sides are polled again
const POLL_WINDOW: Duration = Duration::from_secs(1);

// Minimum LED on-time after each relayed line
const LED_MIN_ON_DURATION: embassy_time::Duration = embassy_time::Duration::from_millis(10);

static LED_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

esp_bootloader_esp_idf::esp_app_desc!();

// USB carries the relayed lines, so there is nowhere to print a backtrace
#[panic_handler]
fn panic(_: &PanicInfo) -> ! {
    loop {}
}

#[embassy_executor::task]
async fn led_task(mut led: StatusLed<'static>) -> ! {
    loop {
        match embassy_time::with_timeout(LED_MIN_ON_DURATION, LED_SIGNAL.wait()).await {
            Ok(()) => led.on(),
            Err(TimeoutError) => led.off(),
        }
    }
}

/// Decides what to do with a line from the host.
///
/// Returns the line to answer the host with, if any.
async fn from_host(frame: Frame, link: &mut Framer<ArduinoPort<'static>>) -> Option<Frame> {
    match frame {
        Frame::Command(cmd) => match link.send(&Frame::Command(cmd)).await {
            Ok(()) => None,
            Err(err) => Some(Frame::Event(Event::SystemError(
                alloc::format!("actuator link write failed: {err:?}"),
            ))),
        },
        Frame::Malformed(line) => Some(Frame::Error(Rejection::of(&line).to_string())),
        // Responses and events only travel towards the host
        _ => None,
    }
}

#[embassy_executor::task]
async fn relay_task(
    mut host: Framer<UsbSerialJtag<'static, Async>>,
    mut link: Framer<ArduinoPort<'static>>,
) -> ! {
    let clock = EmbassyClock;

    loop {
        let deadline = clock.now() + POLL_WINDOW;
        let reply = match select::select(
            host.poll_frame(&clock, deadline),
            link.poll_frame(&clock, deadline),
        )
        .await
        {
            Either::First(Ok(frame)) => from_host(frame, &mut link).await,
            Either::Second(Ok(Frame::Malformed(_))) => None,
            Either::Second(Ok(frame)) => Some(frame),
            // Deadline passed or the USB read failed, poll again
            Either::First(Err(_)) | Either::Second(Err(_)) => continue,
        };

        LED_SIGNAL.signal(());

        if let Some(frame) = reply {
            // Host is gone if this fails, the next line will tell
            let _ = host.send(&frame).await;
        }
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) {
    let peripherals = esp_hal::init(Config::default());

    esp_alloc::heap_allocator!(size: 16 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);

    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    let led = parcelbox_home::new_status_led();
    let host = Framer::new(UsbSerialJtag::new(peripherals.USB_DEVICE).into_async());
    let link = Framer::new(parcelbox_home::new_arduino_port(peripherals.UART1).unwrap());

    spawner.spawn(led_task(led)).unwrap();
    spawner.spawn(relay_task(host, link)).unwrap();
}
