use clap::Parser as ClapParser;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{exit, Command};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transcoder::{
    wait_for_exit, FfmpegTranscoder, HlsLayout, Input, RenditionProfile, StartRequest, Status,
    Transcoder, TranscoderSettings,
};

#[derive(ClapParser, Debug)]
#[command(version, about = "Runs one HLS encoding session outside the server")]
struct Cli {
    #[arg(short, long, default_value = "livecast.toml")]
    config: String,

    /// Media file to encode.
    #[arg(short, long)]
    input: PathBuf,

    /// Prefix of the segment and playlist file names.
    #[arg(long, default_value = "manual")]
    identifier: String,

    /// Loop the input forever, like the offline stream does.
    #[arg(long)]
    event: bool,

    /// Print the ffmpeg command and exit.
    #[arg(short, long)]
    print: bool,

    /// Root of the HLS tree.
    output: PathBuf,
}

#[derive(Deserialize, Debug)]
struct Config {
    #[serde(default)]
    transcoder: TranscoderSettings,
    renditions: Vec<RenditionProfile>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match read_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let layout = HlsLayout::new(&cli.output);
    let request = StartRequest {
        input: Input::File(cli.input),
        profiles: config.renditions,
        identifier: cli.identifier,
        is_event_stream: cli.event,
    };

    let cmd = match config.transcoder.build_ffmpeg_command(&layout, &request) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("build ffmpeg command: {}", e);
            exit(1);
        }
    };

    print_command(&cmd);
    if cli.print {
        exit(0);
    }

    let transcoder = FfmpegTranscoder::new(config.transcoder, layout);
    let session = match transcoder.start(request).await {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    let status = tokio::select! {
        status = wait_for_exit(session.handle.subscribe()) => status,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping encoder");
            if let Err(e) = transcoder.stop(&session.handle).await {
                error!("{}", e);
            }
            session.handle.status()
        }
    };

    match status {
        Status::Exited(0) => info!("Success"),
        other => {
            error!("{}", other);
            exit(1);
        }
    }
}

fn read_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_str)?;
    Ok(config)
}

fn print_command(cmd: &Command) {
    let args: Vec<String> = cmd
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    println!("{} {}", cmd.get_program().to_string_lossy(), args.join(" "));
}
