use clap::{Parser, Subcommand};
use parcelbox::{
    frame::{Command, LockId, StatusReport, Tone},
    framer::Framer,
    link::{Link, Response},
    serial::{Port, TokioClock},
};
use std::{error::Error, time::Duration};

// Listening window of the monitor loop
const MONITOR_WINDOW: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Energize the relay of a lock (AT+LOCK)
    Open {
        /// Lock number (1 = parcel door, 2 = payment box)
        #[arg(value_parser = parse_lock)]
        lock: LockId,
    },
    /// Release the relay of a lock (AT-LOCK)
    Close {
        /// Lock number (1 = parcel door, 2 = payment box)
        #[arg(value_parser = parse_lock)]
        lock: LockId,
    },
    /// Sound the buzzer (AT+BUZZ)
    Buzz {
        /// Tone (SUCCESS or ALERT)
        #[arg(value_parser = parse_tone, default_value = "SUCCESS")]
        tone: Tone,
    },
    /// Query the full status (AT+STATUS)
    Status,
    /// Read the door sensor of a lock (AT+SENSOR)
    Sensor {
        /// Lock number (1 = parcel door, 2 = payment box)
        #[arg(value_parser = parse_lock)]
        lock: LockId,
    },
    /// Print events until interrupted
    Monitor,
}

fn parse_lock(s: &str) -> Result<LockId, String> {
    s.parse().map_err(|_| format!("invalid lock number: {s}"))
}

fn parse_tone(s: &str) -> Result<Tone, String> {
    s.to_uppercase()
        .parse()
        .map_err(|_| format!("invalid tone: {s}"))
}

fn print_report(report: &StatusReport) {
    for id in LockId::ALL {
        let door = report
            .door(id)
            .map_or("unknown".to_string(), |door| door.to_string());
        let relay = report
            .relay(id)
            .map_or("unknown".to_string(), |relay| relay.to_string());

        println!("{id}: door {door}, relay {relay}");
    }
}

fn print_events(link: &Link<Port, TokioClock>) {
    while let Some(event) = link.next_event() {
        println!("Event: {event}");
    }
}

async fn monitor(link: &Link<Port, TokioClock>) -> Result<(), Box<dyn Error>> {
    loop {
        link.pump(MONITOR_WINDOW).await?;
        print_events(link);

        let dropped = link.events().dropped();

        if dropped > 0 {
            eprintln!("Warning: {dropped} events dropped");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let port = parcelbox::serial::open(&args.port)?;
    let mut link = Link::new(Framer::new(port), TokioClock::new());

    link.set_response_timeout(Duration::from_millis(args.timeout));

    let cmd = match args.action {
        Action::Open { lock } => Command::LockOpen(lock),
        Action::Close { lock } => Command::LockClose(lock),
        Action::Buzz { tone } => Command::Buzz(tone),
        Action::Status => Command::StatusQuery,
        Action::Sensor { lock } => Command::SensorRead(lock),
        Action::Monitor => return monitor(&link).await,
    };

    let res = link.execute(&cmd).await?;

    print_events(&link);

    match res {
        Response::Ok(Some(payload)) => match StatusReport::parse(&payload) {
            Some(report) => print_report(&report),
            None => println!("{payload}"),
        },
        Response::Ok(None) => println!("OK"),
        Response::Error(code) => return Err(format!("{cmd} rejected: {code}").into()),
    }

    // Pick up events caused by the command, e.g. DOOR_CLOSED after AT-LOCK
    link.pump(Duration::from_millis(200)).await?;
    print_events(&link);

    Ok(())
}
