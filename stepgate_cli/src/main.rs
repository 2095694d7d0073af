use anyhow::{anyhow, bail, Context};
use clap::Parser;
use stepgate_core::config::parse_ws_url;
use stepgate_core::{
    ConnectionPhase, ConnectionSession, RuntimeTimeSource, SequenceState, SequencerConfig,
    SessionConfig, StallPolicy, CHANNEL_COUNT, STEP_COUNT,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stepgate", about = "Step sequencer driving a remote trigger actuator")]
struct Args {
    /// Actuator websocket endpoint (overrides STEPGATE_WS_URL).
    #[arg(long)]
    ws_url: Option<String>,

    /// Initial tempo in bpm, clamped to 80..=200.
    #[arg(long)]
    tempo: Option<u32>,

    /// Trigger pulse length in milliseconds.
    #[arg(long)]
    trigger_ms: Option<u32>,

    /// What to do with step boundaries missed while the host was busy.
    #[arg(long, value_name = "skip|catch_up")]
    stall_policy: Option<StallPolicy>,

    /// Disable the ping liveness probe.
    #[arg(long, default_value_t = false)]
    no_ping: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Toggle { channel: usize, step: usize },
    Play,
    Stop,
    Tempo(u32),
    Hit { channel: usize, ms: Option<u32> },
    Release(Vec<usize>),
    Clear,
    Show,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();
        let cmd = match (verb, args.as_slice()) {
            ("toggle" | "t", [channel, step]) => Command::Toggle {
                channel: number(channel)?,
                step: number(step)?,
            },
            ("play" | "p", []) => Command::Play,
            ("stop" | "s", []) => Command::Stop,
            ("tempo", [bpm]) => Command::Tempo(number(bpm)?),
            ("hit" | "h", [channel]) => Command::Hit {
                channel: number(channel)?,
                ms: None,
            },
            ("hit" | "h", [channel, ms]) => Command::Hit {
                channel: number(channel)?,
                ms: Some(number(ms)?),
            },
            ("release", channels) => Command::Release(
                channels
                    .iter()
                    .map(|c| number(c))
                    .collect::<anyhow::Result<_>>()?,
            ),
            ("clear", []) => Command::Clear,
            ("show", []) => Command::Show,
            ("help" | "?", []) => Command::Help,
            ("quit" | "q" | "exit", []) => Command::Quit,
            _ => bail!("unrecognised command {line:?} (try `help`)"),
        };
        Ok(Some(cmd))
    }
}

fn number<T: std::str::FromStr>(word: &str) -> anyhow::Result<T> {
    word.parse()
        .map_err(|_| anyhow!("{word:?} is not a valid number"))
}

const HELP: &str = "\
commands:
  toggle <ch> <step>   flip one cell (ch 0-7, step 0-15)
  play | stop          start or stop playback
  tempo <bpm>          set tempo (80-200)
  hit <ch> [ms]        trigger one channel now
  release [ch...]      release channels (all when none given)
  clear                clear the pattern
  show                 print the pattern and status
  quit";

/// Applies one command. Returns false when the host should exit.
fn apply(
    cmd: Command,
    seq: &mut SequenceState<ConnectionSession>,
    session: &ConnectionSession,
) -> anyhow::Result<bool> {
    match cmd {
        Command::Toggle { channel, step } => {
            let on = seq.toggle_step(channel, step)?;
            println!("ch{channel} step {step}: {}", if on { "on" } else { "off" });
        }
        Command::Play => seq.play().context("cannot start playback")?,
        Command::Stop => seq.stop(),
        Command::Tempo(bpm) => println!("tempo {}", seq.set_tempo(bpm)),
        Command::Hit { channel, ms } => {
            let ms = ms.unwrap_or(seq.trigger_ms());
            if !session.send_immediate_trigger(channel, ms)? {
                println!("not connected, trigger dropped");
            }
        }
        Command::Release(channels) => {
            if !session.send_stop_channels(&channels)? {
                println!("not connected, release dropped");
            }
        }
        Command::Clear => seq.clear(),
        Command::Show => print!("{}", render(seq, session)),
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn render(seq: &SequenceState<ConnectionSession>, session: &ConnectionSession) -> String {
    let playback = seq.playback();
    let mut out = String::new();
    for channel in 0..CHANNEL_COUNT {
        out.push_str(&format!("ch{channel} "));
        if let Ok(row) = seq.grid().row(channel) {
            for (step, on) in row.iter().enumerate() {
                if step % 4 == 0 {
                    out.push(' ');
                }
                out.push(if *on { 'x' } else { '.' });
            }
        }
        out.push('\n');
    }
    let state = session.state();
    out.push_str(&format!(
        "{} at {} bpm, step {}/{STEP_COUNT}, actuator {:?}{}\n",
        if playback.running { "playing" } else { "stopped" },
        playback.tempo,
        playback.current_step,
        state.phase,
        state
            .last_error
            .map(|e| format!(" ({e})"))
            .unwrap_or_default(),
    ));
    out
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut session_config = SessionConfig::from_env()?;
    if let Some(url) = args.ws_url.as_deref() {
        session_config.url = parse_ws_url(url)?;
    }
    if args.no_ping {
        session_config.ping_interval = None;
    }

    let mut seq_config = SequencerConfig::from_env()?;
    if let Some(tempo) = args.tempo {
        seq_config.tempo = tempo;
    }
    if let Some(ms) = args.trigger_ms {
        seq_config.trigger_ms = ms;
    }
    if let Some(policy) = args.stall_policy {
        seq_config.stall_policy = policy;
    }

    info!(url = %session_config.url, "connecting to actuator");
    let session = ConnectionSession::builder(session_config)
        .on_status(|state| match state.phase {
            ConnectionPhase::Connected => eprintln!("actuator connected"),
            ConnectionPhase::Disconnected => eprintln!(
                "actuator disconnected{}",
                state
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ),
            ConnectionPhase::Connecting => {}
        })
        .on_error(|err| eprintln!("{err}"))
        .spawn();

    let mut seq = SequenceState::new(seq_config, RuntimeTimeSource, session.clone());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = seq.next_step() => {}
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let cmd = match Command::parse(&line) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => continue,
                    Err(e) => {
                        eprintln!("{e}");
                        continue;
                    }
                };
                match apply(cmd, &mut seq, &session) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("{e:#}"),
                }
            }
        }
    }

    seq.stop();
    session.shutdown();
    let mut state = session.watch();
    let _ = tokio::time::timeout(
        std::time::Duration::from_millis(500),
        state.wait_for(|s| s.phase == ConnectionPhase::Disconnected),
    )
    .await;
    Ok(())
}
