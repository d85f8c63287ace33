//! Command line tool to discover and control MiIO devices

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use miio::core::DEFAULT_PORT;
use miio::{
    Client, Device, DeviceId, Error, Event, PowerState, ProtocolConfig, Result, Rgb, TokenStore,
};

#[derive(Parser, Debug)]
#[command(name = "miio", version, about = "Discover and control MiIO devices on the local network")]
struct Cli {
    /// Broadcast hello packets to 127.0.0.1, for a locally hosted simulator
    #[arg(long, global = true)]
    local: bool,

    /// Address to broadcast hello packets to
    #[arg(long, global = true, default_value = "255.255.255.255")]
    broadcast: IpAddr,

    /// Token store file
    #[arg(long, global = true, default_value = "tokens.txt")]
    tokens: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover devices on the local network
    Discover {
        /// Seconds between discovery broadcasts
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Discover devices and save revealed tokens to the token file
    Capture {
        /// Seconds to listen before exiting
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Control a device
    Control(ControlArgs),
}

#[derive(Args, Debug)]
struct ControlArgs {
    /// The ID of the device to control
    #[arg(long)]
    device_id: u32,

    /// Seconds to wait for the device to be discovered
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Set device power
    Power { state: PowerArg },
    /// Set brightness (1-100)
    Brightness { value: u8 },
    /// Set color using RGB values
    Rgb { red: u8, green: u8, blue: u8 },
    /// Set color using hue (0-359) and saturation (0-100)
    Hsv { hue: u16, saturation: u8 },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PowerArg {
    On,
    Off,
}

impl From<PowerArg> for PowerState {
    fn from(arg: PowerArg) -> Self {
        match arg {
            PowerArg::On => PowerState::On,
            PowerArg::Off => PowerState::Off,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: Level = cli
        .log_level
        .parse()
        .map_err(|_| Error::config(format!("Unknown log level {:?}", cli.log_level)))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let broadcast = if cli.local {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        cli.broadcast
    };
    let mut config = ProtocolConfig {
        broadcast_addr: SocketAddr::new(broadcast, DEFAULT_PORT),
        ..Default::default()
    };
    if matches!(cli.command, Command::Capture { .. }) {
        config.token_file = Some(cli.tokens.clone());
    }

    let tokens = TokenStore::from_file(&cli.tokens)?;
    info!("Loaded {} tokens from {}", tokens.len(), cli.tokens.display());
    let client = Client::bind(config, tokens)?;

    let result = match cli.command {
        Command::Discover { interval } => discover(&client, Duration::from_secs(interval)).await,
        Command::Capture { duration } => {
            capture(&client, Duration::from_secs(duration), &cli.tokens).await
        }
        Command::Control(args) => control(&client, args).await,
    };

    client.shutdown();
    result
}

async fn discover(client: &Client, interval: Duration) -> Result<()> {
    let mut events = client.subscribe()?;
    client.set_discovery_interval(interval);

    while let Some(event) = events.recv().await {
        match event {
            Event::NewDevice(device) => {
                tokio::spawn(async move { print_device(device.as_ref()).await });
            }
            Event::NewMaskedDevice(id) => print_masked_device(id),
            _ => {}
        }
    }
    Ok(())
}

async fn capture(client: &Client, duration: Duration, path: &Path) -> Result<()> {
    let mut events = client.subscribe()?;
    client.set_discovery_interval(Duration::from_secs(2));

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(Event::NewDevice(device)) => {
                    if let Some(token) = device.token() {
                        println!("{}={}", device.id(), token);
                    }
                }
                Some(Event::NewMaskedDevice(id)) => print_masked_device(id),
                Some(_) => {}
                None => break,
            },
        }
    }

    let tokens = client.protocol().tokens();
    println!("{} tokens stored in {}", tokens.len(), path.display());
    Ok(())
}

async fn control(client: &Client, args: ControlArgs) -> Result<()> {
    client.set_discovery_interval(Duration::from_secs(1));
    let device = client
        .find_device(DeviceId(args.device_id), Duration::from_secs(args.timeout))
        .await?;
    let unsupported = |what: &str| {
        Error::config(format!(
            "Device {} ({:?}) cannot {}",
            device.id(),
            device.product(),
            what
        ))
    };

    match args.action {
        Action::Power { state } => match device.power() {
            Some(power) => power.set_power(state.into()).await,
            None => Err(unsupported("switch power")),
        },
        Action::Brightness { value } => match device.light() {
            Some(light) => light.set_brightness(value).await,
            None => Err(unsupported("have brightness adjusted")),
        },
        Action::Rgb { red, green, blue } => match device.light() {
            Some(light) => light.set_rgb(Rgb::new(red, green, blue)).await,
            None => Err(unsupported("change color")),
        },
        Action::Hsv { hue, saturation } => match device.light() {
            Some(light) => light.set_hsv(hue, saturation).await,
            None => Err(unsupported("change color")),
        },
    }
}

async fn print_device(device: &dyn Device) {
    let info = device.base().info().await.unwrap_or_default();
    println!("-------------");
    println!("Discovered new device:");
    println!("ID: {}", device.id());
    println!("Product: {:?}", device.product());
    println!("Firmware Version: {}", info.firmware_version);
    println!("Hardware Version: {}", info.hardware_version);
    println!("Mac Address: {}", info.mac_address);
    println!("Model: {}", info.model);
    if let Some(token) = device.token() {
        println!("Token: {}", token);
    }
    println!("-------------");
}

fn print_masked_device(id: DeviceId) {
    println!("-------------");
    println!("Discovered new device with masked token:");
    println!("ID: {}", id);
    println!("You must manually retrieve this token in order to communicate with the device.");
    println!("-------------");
}
