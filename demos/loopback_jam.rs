use clap::Parser;
use log::info;
use std::rc::Rc;

use play_away::client::JamClient;
use play_away::common::box_error::BoxError;
use play_away::common::config::Config;
use play_away::common::settings::{default_params, Settings};
use play_away::media::local_media::{list_devices, LocalMedia, MediaConstraints};
use play_away::midi::midi_event::{encode, MidiEvent};
use play_away::peer::loopback::{LoopbackBroker, LoopbackDevices};

/// Two players jamming over the in-memory broker

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// name of the player hosting the room
    #[arg(long, default_value = "alice")]
    host: String,

    /// name of the player joining
    #[arg(long, default_value = "bob")]
    guest: String,

    /// notes the host plays (midi note numbers)
    #[arg(short, long, value_delimiter = ',', default_value = "60,64,67")]
    notes: Vec<u8>,

    /// also start a video call
    #[arg(short, long)]
    video: bool,
}

fn settings(name: &str) -> Result<Settings, BoxError> {
    // nothing is read from disk, the defaults plus a name are enough here
    let mut config = Config::build("loopback_jam.json".to_string(), default_params())?;
    config.set_value("name", name)?;
    Settings::from_config(&config)
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let broker = LoopbackBroker::new();
    let host = JamClient::new(settings(&args.host)?, Rc::new(broker.clone()), None);
    let mut guest = JamClient::new(settings(&args.guest)?, Rc::new(broker.clone()), None);
    host.start();
    guest.start();
    broker.pump();
    println!("registered: {:?}", broker.peers());

    if !guest.join(&args.host) {
        println!("{} could not join {}", args.guest, args.host);
        return Ok(());
    }
    broker.pump();

    for note in &args.notes {
        let event = MidiEvent::note_on(*note, 100);
        host.play(&event);
        broker.pump();
        println!("{} plays {} -> {} hears {:?}", args.host, event, args.guest, guest.active_notes());
    }
    for note in &args.notes {
        // what a keyboard would send for the release
        guest.device_input(&encode(&MidiEvent::note_off(*note)));
        broker.pump();
    }
    println!("after release {} hears {:?}", args.host, host.active_notes());

    if args.video {
        let devices = LoopbackDevices::new();
        for device in list_devices(&devices) {
            println!("device {}", device);
        }
        let host_media = LocalMedia::acquire(&devices, &MediaConstraints::from_settings(&settings(&args.host)?, true, true));
        let guest_media = LocalMedia::acquire(&devices, &MediaConstraints::from_settings(&settings(&args.guest)?, true, false));
        guest.call(guest_media.stream());
        broker.pump();
        host.answer(host_media.stream());
        broker.pump();
        println!("{} sees {:?}", args.host, host.remote_stream());
        println!("{} sees {:?}", args.guest, guest.remote_stream());
    }

    info!("status: {}", host.status());
    println!("{}", serde_json::to_string_pretty(&host.status())?);
    guest.shutdown();
    broker.pump();
    println!("{} connections left: {}", args.host, host.registry().len());
    Ok(())
}
