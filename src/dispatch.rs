//! Command dispatcher: a (mostly) pure function of `(command-line,
//! issuer-label)` that mutates the registry, device, and plugin state and
//! produces a reply routed back to the issuing connection.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::{json, Value};

use crate::clock::monotonic_now;
#[cfg(feature = "alsa-backend")]
use crate::device::alsa_backend::AlsaBackend;
#[cfg(not(feature = "alsa-backend"))]
use crate::device::Backend;
use crate::device::rtltcp_backend::RtlTcpBackend;
use crate::device::DeviceMinder;
use crate::error::EngineError;
use crate::net::{Connection, Listener};
use crate::plugin::{DlPluginLoader, PluginLoader, PluginRunner};
use crate::registry::{OutputSink, PollableRegistry, Pollable};
use crate::wav::WavFileWriter;

const RTLSDR_PREFIX: &str = "rtlsdr:";

pub struct Engine {
    pub registry: PollableRegistry,
    loader: Box<dyn PluginLoader>,
    device_labels: HashSet<String>,
    plugin_labels: HashSet<String>,
    /// Device label -> its currently attached WAV writer label, if any.
    wav_for_device: HashMap<String, String>,
    /// Connections that asked for `receiveAll`: every present and future
    /// plugin runner's output is routed to them.
    default_output_subscribers: HashSet<String>,
    pub quit_requested: bool,
}

impl Engine {
    pub fn new(registry: PollableRegistry) -> Self {
        Engine {
            registry,
            loader: Box::new(DlPluginLoader),
            device_labels: HashSet::new(),
            plugin_labels: HashSet::new(),
            wav_for_device: HashMap::new(),
            default_output_subscribers: HashSet::new(),
            quit_requested: false,
        }
    }

    pub fn listen(&mut self, label: String, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        self.listen_with_quiet(label, path, false)
    }

    /// `quiet` suppresses the welcome banner sent to newly accepted
    /// connections on this socket.
    pub fn listen_with_quiet(
        &mut self,
        label: String,
        path: impl AsRef<std::path::Path>,
        quiet: bool,
    ) -> std::io::Result<()> {
        let listener = Listener::bind_with_quiet(label.clone(), path, quiet)?;
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(listener));
        self.registry
            .insert(label, shared)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(())
    }

    /// One iteration: poll, dispatch fd-driven events, then drain and
    /// execute any commands connections peeled off during that dispatch.
    pub fn run_once(&mut self, timeout: Option<std::time::Duration>) -> crate::error::Result<()> {
        self.registry.poll_once(timeout)?;
        self.process_pending_commands();
        Ok(())
    }

    fn process_pending_commands(&mut self) {
        let commands = self.registry.take_pending_commands();
        for (issuer, line) in commands {
            let reply = self.dispatch(&issuer, &line);
            self.write_reply(&issuer, &reply);
        }
    }

    fn write_reply(&mut self, issuer: &str, reply: &str) {
        let Some(shared) = self.registry.lookup(issuer) else {
            return;
        };
        let mut line = reply.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let mut p = shared.borrow_mut();
        if let Some(sink) = p.as_output_sink_mut() {
            let _ = sink.queue_output(line.as_bytes(), monotonic_now());
        }
    }

    fn dispatch(&mut self, issuer: &str, line: &str) -> String {
        let args = split_args(line);
        let Some(verb) = args.first() else {
            return EngineError::InvalidCommand(String::new()).to_json_reply().to_string();
        };
        let rest = &args[1..];

        match verb.as_str() {
            "open" => self.cmd_open(rest),
            "close" => self.cmd_close(rest),
            "start" => self.cmd_start_stop(rest, true),
            "stop" => self.cmd_start_stop(rest, false),
            "startAll" => self.cmd_all(true),
            "stopAll" => self.cmd_all(false),
            "status" => self.cmd_status(rest),
            "list" => self.cmd_list(),
            "attach" => self.cmd_attach(rest),
            "detach" => self.cmd_detach(rest),
            "param" => self.cmd_param(rest),
            "receive" => self.cmd_receive(issuer, rest),
            "receiveAll" => self.cmd_receive_all(issuer),
            "rawStream" => self.cmd_raw_stream(issuer, rest),
            "rawStreamOff" => self.cmd_raw_stream_off(issuer, rest),
            "rawFile" => self.cmd_raw_file(rest),
            "rawFileOff" => self.cmd_raw_file_off(rest),
            "fmOn" => self.cmd_fm(rest, true),
            "fmOff" => self.cmd_fm(rest, false),
            "help" => help_text(),
            "quit" => {
                self.quit_requested = true;
                json!({"quit": true}).to_string()
            }
            other => EngineError::InvalidCommand(other.to_string()).to_json_reply().to_string(),
        }
    }

    fn cmd_open(&mut self, args: &[String]) -> String {
        let [label, dev, rate, nchan] = match args {
            [a, b, c, d] => [a.clone(), b.clone(), c.clone(), d.clone()],
            _ => return error_reply("open requires LABEL DEV RATE NCHAN"),
        };
        let rate: u32 = match rate.parse() {
            Ok(r) => r,
            Err(_) => return error_reply("invalid RATE"),
        };
        let nchan: u8 = match nchan.parse() {
            Ok(n) => n,
            Err(_) => return error_reply("invalid NCHAN"),
        };

        let now = monotonic_now();
        let backend_result = self.build_backend(&dev, rate, nchan);
        let mut backend = match backend_result {
            Ok(b) => b,
            Err(e) => return e.to_json_reply().to_string(),
        };
        if let Err(e) = backend.do_restart() {
            return EngineError::DeviceOpen(e.to_string()).to_json_reply().to_string();
        }

        let minder = DeviceMinder::new(label.clone(), dev, rate, backend, now);
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(minder));
        match self.registry.insert(label.clone(), shared.clone()) {
            Ok(()) => {
                self.device_labels.insert(label.clone());
                describe_of(&shared)
            }
            Err(e) => e.to_json_reply().to_string(),
        }
    }

    #[cfg(feature = "alsa-backend")]
    fn build_backend(&self, dev: &str, rate: u32, nchan: u8) -> crate::error::Result<Box<dyn crate::device::Backend>> {
        if let Some(path) = dev.strip_prefix(RTLSDR_PREFIX) {
            let backend = RtlTcpBackend::new(PathBuf::from(path), rate)
                .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;
            Ok(Box::new(backend))
        } else {
            Ok(Box::new(AlsaBackend::new(dev.to_string(), rate, nchan)))
        }
    }

    #[cfg(not(feature = "alsa-backend"))]
    fn build_backend(&self, dev: &str, rate: u32, _nchan: u8) -> crate::error::Result<Box<dyn Backend>> {
        if let Some(path) = dev.strip_prefix(RTLSDR_PREFIX) {
            let backend = RtlTcpBackend::new(PathBuf::from(path), rate)
                .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;
            Ok(Box::new(backend))
        } else {
            Err(EngineError::DeviceOpen(
                "ALSA backend not compiled in (build with --features alsa-backend)".into(),
            ))
        }
    }

    fn cmd_close(&mut self, args: &[String]) -> String {
        let Some(label) = args.first() else {
            return error_reply("close requires LABEL");
        };
        if let Some(shared) = self.registry.lookup(label) {
            if let Some(dm) = shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
                dm.stop(monotonic_now());
            }
        }
        self.registry.remove(label);
        self.device_labels.remove(label);
        if let Some(wav_label) = self.wav_for_device.remove(label) {
            self.registry.remove(&wav_label);
        }
        json!({"closed": label}).to_string()
    }

    fn cmd_start_stop(&mut self, args: &[String], start: bool) -> String {
        let Some(label) = args.first() else {
            return error_reply("start/stop requires LABEL");
        };
        let Some(shared) = self.registry.lookup(label) else {
            return error_reply(&format!("no such participant '{}'", label));
        };
        if let Some(dm) = shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
            let now = monotonic_now();
            if start {
                if let Err(e) = dm.start(now) {
                    return e.to_json_reply().to_string();
                }
            } else {
                dm.stop(now);
            }
        }
        describe_of(&shared)
    }

    fn cmd_all(&mut self, start: bool) -> String {
        let labels: Vec<String> = self.device_labels.iter().cloned().collect();
        for label in labels {
            self.cmd_start_stop(&[label], start);
        }
        json!({"ok": true}).to_string()
    }

    fn cmd_status(&mut self, args: &[String]) -> String {
        let Some(label) = args.first() else {
            return error_reply("status requires LABEL");
        };
        match self.registry.lookup(label) {
            Some(shared) => describe_of(&shared),
            None => error_reply(&format!("no such participant '{}'", label)),
        }
    }

    fn cmd_list(&mut self) -> String {
        let mut out = serde_json::Map::new();
        for label in self.registry.labels().map(|s| s.to_string()).collect::<Vec<_>>() {
            if let Some(shared) = self.registry.lookup(&label) {
                out.insert(label, shared.borrow().describe());
            }
        }
        Value::Object(out).to_string()
    }

    fn cmd_attach(&mut self, args: &[String]) -> String {
        if args.len() < 5 {
            return error_reply("attach requires DEV PLG SO ID OUT [PAR VAL]*");
        }
        let dev = &args[0];
        let plg = args[1].clone();
        let so = args[2].clone();
        let id = args[3].clone();
        let out = args[4].clone();
        let mut params = HashMap::new();
        let mut i = 5;
        while i + 1 < args.len() {
            let name = args[i].clone();
            let Ok(val) = args[i + 1].parse::<f32>() else {
                return error_reply(&format!("invalid value for parameter '{}'", name));
            };
            params.insert(name, val);
            i += 2;
        }

        let Some(dev_shared) = self.registry.lookup(dev) else {
            return error_reply(&format!("no such device '{}'", dev));
        };
        let (channels, rate, max_sample_abs) = {
            let any = dev_shared.borrow();
            let Some(dm) = any.as_any().downcast_ref::<DeviceMinder>() else {
                return error_reply(&format!("'{}' is not a device", dev));
            };
            (dm.channels(), dm.rate(), dm.max_sample_abs())
        };

        let runner = match PluginRunner::new(
            plg.clone(),
            dev.clone(),
            so,
            id,
            out,
            params,
            channels,
            rate,
            max_sample_abs,
            self.loader.as_ref(),
        ) {
            Ok(r) => r,
            Err(e) => return e.to_json_reply().to_string(),
        };
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(runner));
        if let Err(e) = self.registry.insert(plg.clone(), shared.clone()) {
            return e.to_json_reply().to_string();
        }
        self.plugin_labels.insert(plg.clone());

        {
            let mut any = dev_shared.borrow_mut();
            if let Some(dm) = any.as_any_mut().downcast_mut::<DeviceMinder>() {
                dm.add_plugin_runner(plg.clone(), Rc::downgrade(&shared));
            }
        }

        for sub in self.default_output_subscribers.clone() {
            if let Some(sub_shared) = self.registry.lookup(&sub) {
                let mut any = shared.borrow_mut();
                if let Some(runner) = any.as_any_mut().downcast_mut::<PluginRunner>() {
                    runner.add_output_listener(sub.clone(), Rc::downgrade(&sub_shared));
                }
            }
        }

        describe_of(&shared)
    }

    fn cmd_detach(&mut self, args: &[String]) -> String {
        let Some(plg) = args.first() else {
            return error_reply("detach requires PLG");
        };
        if let Some(shared) = self.registry.lookup(plg) {
            let device_label = shared
                .borrow()
                .as_any()
                .downcast_ref::<PluginRunner>()
                .map(|r| r.device_label().to_string());
            if let Some(dev) = device_label {
                if let Some(dev_shared) = self.registry.lookup(&dev) {
                    if let Some(dm) = dev_shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
                        dm.remove_plugin_runner(plg);
                    }
                }
            }
        }
        self.registry.remove(plg);
        self.plugin_labels.remove(plg);
        json!({"detached": plg}).to_string()
    }

    fn cmd_param(&mut self, args: &[String]) -> String {
        let Some(plg) = args.first() else {
            return error_reply("param requires PLG");
        };
        let Some(shared) = self.registry.lookup(plg) else {
            return error_reply(&format!("no such plugin '{}'", plg));
        };
        let mut params = Vec::new();
        let mut i = 1;
        while i + 1 < args.len() {
            let Ok(val) = args[i + 1].parse::<f32>() else {
                return error_reply(&format!("invalid value for parameter '{}'", args[i]));
            };
            params.push((args[i].clone(), val));
            i += 2;
        }
        let mut any = shared.borrow_mut();
        let Some(runner) = any.as_any_mut().downcast_mut::<PluginRunner>() else {
            return error_reply(&format!("'{}' is not a plugin", plg));
        };
        runner.set_parameters(&params);
        drop(any);
        describe_of(&shared)
    }

    fn cmd_receive(&mut self, issuer: &str, args: &[String]) -> String {
        let Some(plg) = args.first() else {
            return error_reply("receive requires PLG");
        };
        let Some(issuer_shared) = self.registry.lookup(issuer) else {
            return error_reply("issuer not found");
        };
        let Some(plugin_shared) = self.registry.lookup(plg) else {
            return error_reply(&format!("no such plugin '{}'", plg));
        };
        let mut any = plugin_shared.borrow_mut();
        let Some(runner) = any.as_any_mut().downcast_mut::<PluginRunner>() else {
            return error_reply(&format!("'{}' is not a plugin", plg));
        };
        runner.add_output_listener(issuer.to_string(), Rc::downgrade(&issuer_shared));
        json!({"receiving": plg}).to_string()
    }

    fn cmd_receive_all(&mut self, issuer: &str) -> String {
        self.default_output_subscribers.insert(issuer.to_string());
        let Some(issuer_shared) = self.registry.lookup(issuer) else {
            return error_reply("issuer not found");
        };
        for plg in self.plugin_labels.clone() {
            if let Some(plugin_shared) = self.registry.lookup(&plg) {
                let mut any = plugin_shared.borrow_mut();
                if let Some(runner) = any.as_any_mut().downcast_mut::<PluginRunner>() {
                    runner.add_output_listener(issuer.to_string(), Rc::downgrade(&issuer_shared));
                }
            }
        }
        json!({"receivingAll": true}).to_string()
    }

    fn cmd_raw_stream(&mut self, issuer: &str, args: &[String]) -> String {
        let [dev, rate, fmflag] = match args {
            [a, b, c] => [a.clone(), b.clone(), c.clone()],
            _ => return error_reply("rawStream requires DEV RATE FMFLAG"),
        };
        let rate: u32 = match rate.parse() {
            Ok(r) => r,
            Err(_) => return error_reply("invalid RATE"),
        };
        let fm_on = fmflag != "0";

        let Some(dev_shared) = self.registry.lookup(&dev) else {
            return error_reply(&format!("no such device '{}'", dev));
        };
        let Some(issuer_shared) = self.registry.lookup(issuer) else {
            return error_reply("issuer not found");
        };

        if let Some(conn) = issuer_shared.borrow_mut().as_any_mut().downcast_mut::<Connection>() {
            conn.set_raw_output(true);
        }

        let mut any = dev_shared.borrow_mut();
        let Some(dm) = any.as_any_mut().downcast_mut::<DeviceMinder>() else {
            return error_reply(&format!("'{}' is not a device", dev));
        };
        let decimation_factor = (dm.hw_rate() / rate.max(1)).max(1);
        if fm_on && dm.channels() == 2 {
            dm.set_fm_demod(true);
        }
        dm.add_raw_listener(issuer.to_string(), &issuer_shared, decimation_factor, false, true);
        drop(any);
        let _ = self.registry.sync_registration(&dev);
        json!({"rawStream": dev, "rate": rate}).to_string()
    }

    fn cmd_raw_stream_off(&mut self, issuer: &str, args: &[String]) -> String {
        let Some(dev) = args.first() else {
            return error_reply("rawStreamOff requires DEV");
        };
        if let Some(dev_shared) = self.registry.lookup(dev) {
            if let Some(dm) = dev_shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
                dm.remove_raw_listener(issuer);
            }
        }
        json!({"rawStreamOff": dev}).to_string()
    }

    fn cmd_raw_file(&mut self, args: &[String]) -> String {
        if args.len() < 4 {
            return error_reply("rawFile requires DEV RATE FRAMES PATH_TEMPLATE");
        }
        let dev = args[0].clone();
        let rate: u32 = match args[1].parse() {
            Ok(r) => r,
            Err(_) => return error_reply("invalid RATE"),
        };
        let frames: u64 = match args[2].parse() {
            Ok(f) => f,
            Err(_) => return error_reply("invalid FRAMES"),
        };
        let template = args[3..].join(" ");

        let Some(dev_shared) = self.registry.lookup(&dev) else {
            return error_reply(&format!("no such device '{}'", dev));
        };

        if let Some(existing_label) = self.wav_for_device.get(&dev).cloned() {
            if let Some(wav_shared) = self.registry.lookup(&existing_label) {
                if let Some(w) = wav_shared.borrow_mut().as_any_mut().downcast_mut::<WavFileWriter>() {
                    w.resume_with_new_file(template, frames);
                    return describe_of(&wav_shared);
                }
            }
        }

        let (channels, decimation_factor, wav_rate) = {
            let any = dev_shared.borrow();
            let Some(dm) = any.as_any().downcast_ref::<DeviceMinder>() else {
                return error_reply(&format!("'{}' is not a device", dev));
            };
            let decimation_factor = (dm.hw_rate() / rate.max(1)).max(1);
            (dm.channels(), decimation_factor, dm.hw_rate() / decimation_factor)
        };

        let wav_label = format!("Wav#{}", dev);
        let writer = WavFileWriter::new(wav_label.clone(), dev.clone(), wav_rate, channels, frames, template);
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(writer));
        if let Err(e) = self.registry.insert(wav_label.clone(), shared.clone()) {
            return e.to_json_reply().to_string();
        }
        self.wav_for_device.insert(dev.clone(), wav_label.clone());

        let mut any = dev_shared.borrow_mut();
        if let Some(dm) = any.as_any_mut().downcast_mut::<DeviceMinder>() {
            dm.add_raw_listener(wav_label.clone(), &shared, decimation_factor, true, true);
        }
        drop(any);
        let _ = self.registry.sync_registration(&dev);

        describe_of(&shared)
    }

    fn cmd_raw_file_off(&mut self, args: &[String]) -> String {
        let Some(dev) = args.first() else {
            return error_reply("rawFileOff requires DEV");
        };
        if let Some(wav_label) = self.wav_for_device.remove(dev) {
            if let Some(dev_shared) = self.registry.lookup(dev) {
                if let Some(dm) = dev_shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
                    dm.remove_raw_listener(&wav_label);
                }
            }
            self.registry.remove(&wav_label);
        }
        json!({"rawFileOff": dev}).to_string()
    }

    fn cmd_fm(&mut self, args: &[String], on: bool) -> String {
        let Some(dev) = args.first() else {
            return error_reply("fmOn/fmOff requires DEV");
        };
        let Some(dev_shared) = self.registry.lookup(dev) else {
            return error_reply(&format!("no such device '{}'", dev));
        };
        if let Some(dm) = dev_shared.borrow_mut().as_any_mut().downcast_mut::<DeviceMinder>() {
            dm.set_fm_demod(on);
        }
        json!({"fm": on, "dev": dev}).to_string()
    }
}

fn describe_of(shared: &Rc<RefCell<dyn Pollable>>) -> String {
    shared.borrow().describe().to_string()
}

fn error_reply(msg: &str) -> String {
    json!({"error": msg}).to_string()
}

fn help_text() -> String {
    "open close start stop startAll stopAll status list attach detach param \
     receive receiveAll rawStream rawStreamOff rawFile rawFileOff fmOn fmOff help quit"
        .to_string()
}

/// Split a command line on whitespace, honoring double-quoted arguments
/// (used by `rawFile`'s `PATH_TEMPLATE`).
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_honors_quotes() {
        let args = split_args(r#"rawFile dev0 8000 16000 "/tmp/%Y-%m-%d.wav""#);
        assert_eq!(args[0], "rawFile");
        assert_eq!(args[4], "/tmp/%Y-%m-%d.wav");
    }

    #[test]
    fn unknown_verb_is_reported() {
        let mut engine = Engine::new(PollableRegistry::new().unwrap());
        let reply = engine.dispatch("nobody", "bogusVerb");
        assert!(reply.contains("invalid command"));
    }

    #[test]
    fn quit_sets_flag() {
        let mut engine = Engine::new(PollableRegistry::new().unwrap());
        engine.dispatch("nobody", "quit");
        assert!(engine.quit_requested);
    }

    #[test]
    fn status_on_missing_label_is_an_error() {
        let mut engine = Engine::new(PollableRegistry::new().unwrap());
        let reply = engine.dispatch("nobody", "status dev0");
        assert!(reply.contains("error"));
    }
}
