//! Console: tuning variables and commands.
//!
//! Every node carries one. Cvars hold vehicle and input tuning; the node reads
//! back the names changed since its last look and pushes them into the
//! controller and input channel between ticks.
//!
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("veh_max_torque", CvarValue::Float(1500.0), "Drive torque", CvarFlags::TUNING);
//! console.exec("veh_max_torque 1800")?;
//! for name in console.take_changed() { /* apply */ }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context};

/// Console variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl CvarValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            CvarValue::Float(v) => Some(*v),
            CvarValue::Int(v) => Some(*v as f64),
            CvarValue::String(s) => s.parse().ok(),
            CvarValue::Bool(_) => None,
        }
    }

    /// Parses `text` into the same variant as `self`.
    fn parse_like(&self, text: &str) -> anyhow::Result<CvarValue> {
        let text = text.trim_matches('"');
        Ok(match self {
            CvarValue::Int(_) => CvarValue::Int(text.parse().context("expected an integer")?),
            CvarValue::Float(_) => {
                let v: f64 = text.parse().context("expected a number")?;
                if !v.is_finite() {
                    bail!("expected a finite number");
                }
                CvarValue::Float(v)
            }
            CvarValue::Bool(_) => CvarValue::Bool(match text {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => bail!("expected a boolean"),
            }),
            CvarValue::String(_) => CvarValue::String(text.to_string()),
        })
    }
}

impl std::fmt::Display for CvarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{}", v),
            CvarValue::Float(v) => write!(f, "{}", v),
            CvarValue::String(v) => write!(f, "\"{}\"", v),
            CvarValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub value: CvarValue,
    pub default: CvarValue,
    pub description: String,
    pub flags: CvarFlags,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        const NONE = 0;
        const TUNING = 1 << 0;      // Feeds the vehicle controller
        const LOCAL = 1 << 1;       // Affects only this node's sampling
        const READ_ONLY = 1 << 2;   // Reported, never set from the console
    }
}

impl Default for CvarFlags {
    fn default() -> Self {
        Self::NONE
    }
}

pub type CommandHandler =
    Box<dyn Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Handed to command handlers.
pub struct ConsoleContext<'a> {
    pub output: Vec<String>,
    cvars: &'a mut BTreeMap<String, Cvar>,
    changed: &'a mut BTreeSet<String>,
}

impl ConsoleContext<'_> {
    pub fn print(&mut self, msg: impl Into<String>) {
        self.output.push(msg.into());
    }

    /// Sets a cvar from console text, keeping its type.
    pub fn set_cvar_text(&mut self, name: &str, text: &str) -> anyhow::Result<CvarValue> {
        let Some(cvar) = self.cvars.get_mut(name) else {
            bail!("unknown cvar: {}", name);
        };
        if cvar.flags.contains(CvarFlags::READ_ONLY) {
            bail!("{} is read-only", name);
        }
        let value = cvar
            .default
            .parse_like(text)
            .with_context(|| format!("cvar '{}'", name))?;
        if cvar.value != value {
            cvar.value = value.clone();
            self.changed.insert(name.to_string());
        }
        Ok(value)
    }
}

pub struct Console {
    cvars: BTreeMap<String, Cvar>,
    commands: BTreeMap<String, CommandHandler>,
    changed: BTreeSet<String>,
    history: Vec<String>,
    max_history: usize,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let mut console = Self {
            cvars: BTreeMap::new(),
            commands: BTreeMap::new(),
            changed: BTreeSet::new(),
            history: Vec::new(),
            max_history: 100,
        };
        console.register_builtin_commands();
        console
    }

    fn register_builtin_commands(&mut self) {
        self.register_command("echo", |args, ctx| {
            ctx.print(args.join(" "));
            Ok(())
        });

        self.register_command("cvarlist", |_args, ctx| {
            let lines: Vec<String> = ctx
                .cvars
                .values()
                .map(|c| format!("  {} = {} (default: {}) {}", c.name, c.value, c.default, c.description))
                .collect();
            for line in lines {
                ctx.print(line);
            }
            Ok(())
        });

        self.register_command("set", |args, ctx| {
            if args.len() < 2 {
                bail!("usage: set <cvar> <value>");
            }
            let name = args[0];
            let value = ctx.set_cvar_text(name, &args[1..].join(" "))?;
            ctx.print(format!("{} = {}", name, value));
            Ok(())
        });

        self.register_command("reset", |args, ctx| {
            let Some(name) = args.first() else {
                bail!("usage: reset <cvar>");
            };
            let default = match ctx.cvars.get(*name) {
                Some(c) => c.default.to_string(),
                None => bail!("unknown cvar: {}", name),
            };
            let value = ctx.set_cvar_text(name, &default)?;
            ctx.print(format!("{} = {}", name, value));
            Ok(())
        });
    }

    pub fn register_cvar(&mut self, name: &str, default: CvarValue, description: &str, flags: CvarFlags) {
        let cvar = Cvar {
            name: name.to_string(),
            value: default.clone(),
            default,
            description: description.to_string(),
            flags,
        };
        self.cvars.insert(name.to_string(), cvar);
    }

    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_string(), Box::new(handler));
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    /// Executes a console line and returns what it printed.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Vec::new());
        }

        self.history.push(line.to_string());
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        let tokens = parse_command_line(line);
        let Some((cmd_name, rest)) = tokens.split_first() else {
            return Ok(Vec::new());
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();

        let mut ctx = ConsoleContext {
            output: Vec::new(),
            cvars: &mut self.cvars,
            changed: &mut self.changed,
        };

        if let Some(handler) = self.commands.get(cmd_name.as_str()) {
            handler(&args, &mut ctx).with_context(|| format!("command '{}'", cmd_name))?;
            return Ok(ctx.output);
        }

        // Bare cvar name queries it; name plus value sets it.
        let current = ctx
            .cvars
            .get(cmd_name.as_str())
            .map(|c| (c.value.clone(), c.default.clone()));
        match current {
            Some((value, default)) if args.is_empty() => {
                ctx.print(format!("{} = {} (default: {})", cmd_name, value, default));
            }
            Some(_) => {
                let value = ctx.set_cvar_text(cmd_name, &args.join(" "))?;
                ctx.print(format!("{} = {}", cmd_name, value));
            }
            None => ctx.print(format!("Unknown command: {}", cmd_name)),
        }
        Ok(ctx.output)
    }

    pub fn get_cvar(&self, name: &str) -> Option<&CvarValue> {
        self.cvars.get(name).map(|c| &c.value)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get_cvar(name).and_then(CvarValue::as_float)
    }

    /// Names of cvars changed since the last call.
    pub fn take_changed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.changed).into_iter().collect()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Splits a console line into tokens, respecting quotes.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning_console() -> Console {
        let mut console = Console::new();
        console.register_cvar("veh_max_torque", CvarValue::Float(1500.0), "Drive torque", CvarFlags::TUNING);
        console.register_cvar("node_id", CvarValue::Int(1), "Participant id", CvarFlags::READ_ONLY);
        console
    }

    #[test]
    fn set_keeps_type_and_records_change() {
        let mut console = tuning_console();
        console.exec("set veh_max_torque 1800").unwrap();
        assert_eq!(console.get_float("veh_max_torque"), Some(1800.0));
        assert_eq!(console.take_changed(), vec!["veh_max_torque".to_string()]);
        assert!(console.take_changed().is_empty());

        assert!(console.exec("set veh_max_torque fast").is_err());
        assert_eq!(console.get_float("veh_max_torque"), Some(1800.0));
    }

    #[test]
    fn bare_name_queries_and_name_value_sets() {
        let mut console = tuning_console();
        let out = console.exec("veh_max_torque").unwrap();
        assert_eq!(out, vec!["veh_max_torque = 1500 (default: 1500)".to_string()]);

        console.exec("veh_max_torque 900").unwrap();
        console.exec("reset veh_max_torque").unwrap();
        assert_eq!(console.get_float("veh_max_torque"), Some(1500.0));
    }

    #[test]
    fn read_only_cvar_refuses_console_writes() {
        let mut console = tuning_console();
        assert!(console.exec("node_id 5").is_err());
        assert_eq!(console.get_cvar("node_id"), Some(&CvarValue::Int(1)));
    }

    #[test]
    fn unknown_command_is_reported_not_failed() {
        let mut console = tuning_console();
        assert_eq!(console.exec("warp 9").unwrap(), vec!["Unknown command: warp".to_string()]);
        assert_eq!(console.history().len(), 1);
    }

    #[test]
    fn parse_quoted_args() {
        let tokens = parse_command_line(r#"echo "hello world" test"#);
        assert_eq!(tokens, vec!["echo", "hello world", "test"]);
    }
}
