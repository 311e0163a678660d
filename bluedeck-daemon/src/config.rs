use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::CommandSpec;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bluedeck/bluedeckd.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub bluetooth: BluetoothConfig,
    pub audio: AudioConfig,
    pub opp: OppConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub adapter: String,
    pub pair_poll_interval_ms: u64,
    pub pair_poll_attempts: u32,
    pub le_profile_uuid: String,
    pub call_timeout_secs: u64,
    /// Upper bound for a single inquiry request.
    pub max_inquiry_secs: u64,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub capability: String,
    pub auto_accept: bool,
    pub pin_code: Option<String>,
}

/// Streaming helpers. `{file}`, `{input}` and `{output}` in argument
/// templates are replaced at launch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    pub player: String,
    pub player_args: Vec<String>,
    pub sink_env: String,
    pub transcoder: String,
    pub transcoder_args: Vec<String>,
    pub transcode_extensions: Vec<String>,
    pub scratch_dir: PathBuf,
    pub sink_query: Vec<String>,
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OppConfig {
    pub enabled: bool,
    pub receiver: String,
    pub receiver_args: Vec<String>,
    pub receive_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub session_settle_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/bluedeck/bluedeck.sock".to_string(),
            bluetooth: BluetoothConfig::default(),
            audio: AudioConfig::default(),
            opp: OppConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            pair_poll_interval_ms: 500,
            pair_poll_attempts: 20,
            le_profile_uuid: "0000110e-0000-1000-8000-00805f9b34fb".to_string(),
            call_timeout_secs: 30,
            max_inquiry_secs: 60,
            agent: AgentConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capability: "NoInputNoOutput".to_string(),
            auto_accept: true,
            pin_code: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            player: "aplay".to_string(),
            player_args: strings(&["-D", "pulse", "{file}"]),
            sink_env: "PULSE_SINK".to_string(),
            transcoder: "ffmpeg".to_string(),
            transcoder_args: strings(&["-y", "-i", "{input}", "{output}"]),
            transcode_extensions: strings(&["mp3", "ogg", "flac", "m4a", "aac", "opus"]),
            scratch_dir: std::env::temp_dir(),
            sink_query: strings(&["pactl", "list", "short", "sinks"]),
            terminate_grace_ms: 3000,
        }
    }
}

impl Default for OppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            receiver: "obexpushd".to_string(),
            receiver_args: strings(&["-B", "-o", "{dir}", "-n"]),
            receive_dir: PathBuf::from("/tmp"),
            poll_interval_ms: 500,
            poll_attempts: 20,
            session_settle_ms: 1000,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Some(dir) = Path::new(path).parent() {
                    let _ = fs::create_dir_all(dir);
                }
                let _ = fs::write(path, toml::to_string_pretty(&config)?);
                Ok(config)
            }
        }
    }
}

impl AudioConfig {
    /// Whether `file` must be converted to WAV before playback.
    pub fn needs_transcode(&self, file: &Path) -> bool {
        file.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.transcode_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    pub fn player_command(&self, file: &Path, sink: &str) -> CommandSpec {
        let file = file.display().to_string();
        CommandSpec::new(&self.player)
            .args(fill(&self.player_args, &[("{file}", &file)]))
            .env(&self.sink_env, sink)
    }

    pub fn transcode_command(&self, input: &Path, output: &Path) -> CommandSpec {
        let (input, output) = (input.display().to_string(), output.display().to_string());
        CommandSpec::new(&self.transcoder).args(fill(
            &self.transcoder_args,
            &[("{input}", &input), ("{output}", &output)],
        ))
    }

    pub fn sink_query_command(&self) -> CommandSpec {
        match self.sink_query.split_first() {
            Some((program, args)) => CommandSpec::new(program).args(args.iter().cloned()),
            None => CommandSpec::new("pactl").args(["list", "short", "sinks"]),
        }
    }
}

impl OppConfig {
    pub fn receiver_command(&self, dir: &Path) -> CommandSpec {
        let dir = dir.display().to_string();
        CommandSpec::new(&self.receiver).args(fill(&self.receiver_args, &[("{dir}", &dir)]))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn fill(template: &[String], values: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            values
                .iter()
                .fold(arg.clone(), |arg, (key, value)| arg.replace(key, value))
        })
        .collect()
}
