use clap::Parser;

use play_away::broker::broker_api::{joinable_rooms, BrokerApi};
use play_away::common::box_error::BoxError;
use play_away::common::settings::Settings;

/// List the rooms registered with the configured broker

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// settings file
    #[arg(short, long)]
    settings: Option<String>,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();
    let settings = Settings::load(args.settings.as_deref())?;
    let api = BrokerApi::new(settings.broker.clone());
    let rooms = joinable_rooms(&api, settings.requested_peer_id());
    if rooms.is_empty() {
        println!("no rooms on {}", settings.broker.host);
    }
    for room in rooms {
        println!("{}", room);
    }
    Ok(())
}
