//! In-memory controller and port source for the tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream},
    task::JoinHandle,
};

use crate::{connector::Connector, refresher::RefreshGate, Error, Result};

const DUPLEX_BUF: usize = 1024;

pub(crate) struct FakeState {
    /// positions in ticks, X Y Z
    pub ticks: [i64; 3],
    pub limits: [char; 3],
    pub speeds: [f64; 3],
    /// number of `RS <axis>?` queries answered busy after each move
    pub busy_polls: u32,
    remaining: [u32; 3],
    /// commands starting with the prefix are answered `:N-<code>`
    pub nak: Option<(String, u32)>,
    /// commands starting with the prefix are never answered
    pub mute: Option<String>,
    pub probe_reply: String,
    pub log: Vec<String>,
    /// when set, the pause state is recorded at each motion command
    pub gate: Option<Arc<RefreshGate>>,
    pub paused_at_motion: Vec<bool>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            ticks: [0; 3],
            limits: ['f'; 3],
            speeds: [1.0; 3],
            busy_polls: 2,
            remaining: [0; 3],
            nak: None,
            mute: None,
            probe_reply: ":A MS2000 USB-9.2n\r\n".into(),
            log: Vec::new(),
            gate: None,
            paused_at_motion: Vec::new(),
        }
    }
}

fn axis_index(arg: &str) -> Option<usize> {
    match arg.chars().next()? {
        'X' => Some(0),
        'Y' => Some(1),
        'Z' => Some(2),
        _ => None,
    }
}

fn assignment(arg: &str) -> Option<(usize, f64)> {
    let (axis, value) = arg.split_once('=')?;
    Some((axis_index(axis)?, value.trim().parse().ok()?))
}

/// A scripted MS2000. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeMs2000 {
    state: Arc<Mutex<FakeState>>,
}

impl FakeMs2000 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.with(|s| s.log.iter().filter(|c| c.starts_with(prefix)).count())
    }

    fn handle(&self, line: &str) -> Option<String> {
        let mut s = self.state.lock().unwrap();
        s.log.push(line.to_string());
        if matches!(line.split_whitespace().next(), Some("M" | "R" | "SI" | "!")) {
            if let Some(paused) = s.gate.as_ref().map(|g| g.is_paused()) {
                s.paused_at_motion.push(paused);
            }
        }
        if let Some(prefix) = &s.mute {
            if line.starts_with(prefix.as_str()) {
                return None;
            }
        }
        if let Some((prefix, code)) = &s.nak {
            if line.starts_with(prefix.as_str()) {
                return Some(format!(":A :N-{code}\r\n"));
            }
        }

        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        let axes: Vec<usize> = args.iter().filter_map(|a| axis_index(a)).collect();
        let busy = s.busy_polls;

        let reply = match cmd {
            "N" => return Some(s.probe_reply.clone()),
            "V" => ":A Version: USB-9.2n".to_string(),
            "W" => {
                let values: Vec<String> = axes.iter().map(|i| s.ticks[*i].to_string()).collect();
                format!(":A {}", values.join(" "))
            }
            "RS" if args.iter().all(|a| a.ends_with('-')) => {
                let states: String = axes.iter().map(|i| s.limits[*i]).collect();
                format!(":A {states}")
            }
            "RS" => {
                let mut flags = Vec::new();
                for i in axes {
                    if s.remaining[i] > 0 {
                        s.remaining[i] -= 1;
                        flags.push("B");
                    } else {
                        flags.push("N");
                    }
                }
                format!(":A {}", flags.join(" "))
            }
            "S" if args.iter().all(|a| a.ends_with('?')) => {
                let values: Vec<String> = args
                    .iter()
                    .filter_map(|a| {
                        let i = axis_index(a)?;
                        Some(format!("{}={:.6}", &a[..1], s.speeds[i]))
                    })
                    .collect();
                format!(":A {}", values.join(" "))
            }
            "S" => {
                for (i, v) in args.iter().filter_map(|a| assignment(a)) {
                    s.speeds[i] = v;
                }
                ":A".to_string()
            }
            "M" => {
                for (i, v) in args.iter().filter_map(|a| assignment(a)) {
                    s.ticks[i] = v as i64;
                    s.remaining[i] = busy;
                }
                ":A".to_string()
            }
            "R" => {
                for (i, v) in args.iter().filter_map(|a| assignment(a)) {
                    s.ticks[i] += v as i64;
                    s.remaining[i] = busy;
                }
                ":A".to_string()
            }
            "SI" | "!" => {
                for i in axes {
                    s.ticks[i] = 0;
                    s.remaining[i] = busy;
                }
                ":A".to_string()
            }
            "Z" => {
                s.ticks = [0; 3];
                ":A".to_string()
            }
            "HALT" => {
                s.remaining = [0; 3];
                ":A".to_string()
            }
            "RESET" => ":A".to_string(),
            _ => ":A :N-1".to_string(),
        };
        Some(format!("{reply}\r\n"))
    }

    /// Answer commands arriving on `io` until the other end hangs up.
    pub fn serve(&self, io: DuplexStream) -> JoinHandle<()> {
        let fake = self.clone();
        tokio::spawn(async move {
            let (rdr, mut wtr) = tokio::io::split(io);
            let mut lines = BufReader::new(rdr).split(b'\r');
            while let Ok(Some(line)) = lines.next_segment().await {
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if let Some(reply) = fake.handle(&line) {
                    if wtr.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

pub(crate) enum PortBehavior {
    /// held by another process
    Busy,
    /// open fails for a reason other than being held
    OpenFails,
    /// opens, never answers
    Silent,
    /// answers the probe with this text
    OtherDevice(&'static str),
    /// answers the probe in several pieces
    SlowDevice(Vec<&'static str>),
    Device(FakeMs2000),
}

impl PortBehavior {
    pub fn device() -> Self {
        Self::Device(FakeMs2000::new())
    }
}

pub(crate) struct MockConnector {
    ports: Vec<(String, PortBehavior)>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn new(ports: Vec<(&str, PortBehavior)>) -> Self {
        Self {
            ports: ports.into_iter().map(|(n, b)| (n.to_string(), b)).collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// One port with a fake controller attached.
    pub fn single(name: &str, fake: &FakeMs2000) -> Self {
        Self::new(vec![(name, PortBehavior::Device(fake.clone()))])
    }

    pub fn open_attempts(&self, name: &str) -> usize {
        self.attempts.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

/// Read whatever arrives, reply with `chunks` after the first CR.
fn answer_probe(io: DuplexStream, chunks: Vec<&'static str>) {
    tokio::spawn(async move {
        let (mut rdr, mut wtr) = tokio::io::split(io);
        let mut buf = [0u8; 64];
        let mut answered = chunks.is_empty();
        loop {
            match rdr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if answered || !buf[..n].contains(&b'\r') {
                        continue;
                    }
                    answered = true;
                    for chunk in &chunks {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        if wtr.write_all(chunk.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

impl Connector for MockConnector {
    type Port = DuplexStream;

    fn available_ports(&self) -> Result<Vec<String>> {
        Ok(self.ports.iter().map(|(n, _)| n.clone()).collect())
    }

    fn open(&self, name: &str) -> Result<Self::Port> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        let unavailable = |busy: bool, reason: &str| Error::PortUnavailable {
            port: name.to_string(),
            busy,
            reason: reason.to_string(),
        };
        let Some((_, behavior)) = self.ports.iter().find(|(n, _)| n == name) else {
            return Err(unavailable(false, "no such port"));
        };
        match behavior {
            PortBehavior::Busy => Err(unavailable(true, "Access is denied.")),
            PortBehavior::OpenFails => Err(unavailable(false, "device not configured")),
            PortBehavior::Silent => {
                let (host, device) = tokio::io::duplex(DUPLEX_BUF);
                answer_probe(device, Vec::new());
                Ok(host)
            }
            PortBehavior::OtherDevice(text) => {
                let (host, device) = tokio::io::duplex(DUPLEX_BUF);
                answer_probe(device, vec![*text]);
                Ok(host)
            }
            PortBehavior::SlowDevice(chunks) => {
                let (host, device) = tokio::io::duplex(DUPLEX_BUF);
                answer_probe(device, chunks.clone());
                Ok(host)
            }
            PortBehavior::Device(fake) => {
                let (host, device) = tokio::io::duplex(DUPLEX_BUF);
                fake.serve(device);
                Ok(host)
            }
        }
    }
}
