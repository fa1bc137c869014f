use clap::Parser;
use parcelbox::{
    actuator::{Hardware, Station},
    frame::{DoorState, LockId, RelayState, Tone},
    serial::TokioClock,
};
use std::{
    error::Error,
    io::{self, BufRead},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Interval between door sensor scans in milliseconds
    #[arg(short, long, default_value_t = 20)]
    scan_interval: u64,
}

/// Doors operated from standard input, relays and buzzer printed to standard output.
struct SimulatedHardware {
    doors: Arc<Mutex<[DoorState; 2]>>,
}

impl Hardware for SimulatedHardware {
    fn set_relay(&mut self, id: LockId, relay: RelayState) {
        println!("Relay {}: {relay}", id.number());
    }

    fn read_sensor(&mut self, id: LockId) -> DoorState {
        self.doors.lock().unwrap_or_else(PoisonError::into_inner)[id.index()]
    }

    async fn buzz(&mut self, tone: Tone) {
        println!("Buzzer: {tone}");
        tokio::time::sleep(tone.duration()).await;
    }
}

/// Reads lines such as `open 1` or `close 2` and updates the simulated doors.
fn read_doors(doors: &Mutex<[DoorState; 2]>) {
    println!("Enter `open <lock>` or `close <lock>` to operate a door");

    for line in io::stdin().lock().lines().map_while(Result::ok) {
        let mut parts = line.split_whitespace();
        let door = match parts.next() {
            Some("open") => DoorState::Open,
            Some("close") => DoorState::Closed,
            _ => {
                eprintln!("Unknown input: {line}");
                continue;
            }
        };
        let Some(id) = parts.next().and_then(|num| num.parse::<LockId>().ok()) else {
            eprintln!("Invalid lock number: {line}");
            continue;
        };

        doors.lock().unwrap_or_else(PoisonError::into_inner)[id.index()] = door;
        println!("Door {}: {door}", id.number());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let port = parcelbox::serial::open(&args.port)?;
    let doors = Arc::new(Mutex::new([DoorState::Closed; 2]));
    let hw = SimulatedHardware {
        doors: Arc::clone(&doors),
    };

    thread::spawn(move || read_doors(&doors));

    let mut station = Station::new(port, TokioClock::new(), hw)
        .with_scan_interval(Duration::from_millis(args.scan_interval));

    station.serve().await?;

    Ok(())
}
