//! Command-line interface and REPL
//!
//! The REPL runs on its own OS thread because `rustyline` blocks on stdin.
//! Commands go straight to the shared registry; `save` borrows the Tokio
//! runtime for the async file write.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use colored::*;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::device::{DeviceSubsystem, Inventory};
use crate::error::format_error_chain;
use crate::persistence::RoutingDocument;
use crate::registry::Registry;

/// A parsed REPL command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Sync,
    Echo { input: String, enabled: bool },
    Send { output: String, input: String, enabled: bool },
    Focus { output: String, input: String, rule: String },
    Save,
    Help,
    Quit,
}

/// Split a command line on whitespace; double quotes group words
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            },
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            },
            c => {
                current.push(c);
                has_token = true;
            },
        }
    }

    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on/off, got '{}'", other)),
    }
}

/// Parse one REPL line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let tokens = tokenize(line)?;
    let Some((verb, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match (verb.to_ascii_lowercase().as_str(), args) {
        ("list" | "ls", []) => Command::List,
        ("sync", []) => Command::Sync,
        ("echo", [input, state]) => Command::Echo {
            input: input.clone(),
            enabled: parse_switch(state)?,
        },
        ("send", [output, input, state]) => Command::Send {
            output: output.clone(),
            input: input.clone(),
            enabled: parse_switch(state)?,
        },
        ("focus", [output, input]) => Command::Focus {
            output: output.clone(),
            input: input.clone(),
            rule: String::new(),
        },
        ("focus", [output, input, rule]) => Command::Focus {
            output: output.clone(),
            input: input.clone(),
            rule: rule.clone(),
        },
        ("save", []) => Command::Save,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        (verb, _) => return Err(format!("unknown or malformed command '{}' (try 'help')", verb)),
    };
    Ok(Some(command))
}

/// What the REPL needs from the running application
pub struct ReplContext {
    pub registry: Arc<Mutex<Registry>>,
    pub routing_path: PathBuf,
    pub runtime: tokio::runtime::Handle,
}

/// Read and execute commands until `quit`, Ctrl-C or end of input
pub fn run_repl(ctx: ReplContext) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", "Type 'help' for commands.".dimmed());

    loop {
        match rl.readline("echo> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match parse_command(&line) {
                    Ok(None) => {},
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => execute(&ctx, command),
                    Err(msg) => println!("{} {}", "error:".red().bold(), msg),
                }
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn execute(ctx: &ReplContext, command: Command) {
    match command {
        Command::List => print_routing(&ctx.registry.lock()),
        Command::Sync => {
            let report = ctx.registry.lock().reconcile();
            println!("{} {}", "synced:".green(), report);
        },
        Command::Echo { input, enabled } => {
            let mut registry = ctx.registry.lock();
            if registry.input(&input).is_none() {
                return unknown("input", &input);
            }
            report(registry.set_echo(&input, enabled));
        },
        Command::Send {
            output,
            input,
            enabled,
        } => {
            let mut registry = ctx.registry.lock();
            if registry.input(&input).is_none() {
                return unknown("input", &input);
            }
            if registry.output(&output).is_none() {
                return unknown("output", &output);
            }
            report(registry.set_target_mute(&output, &input, !enabled));
        },
        Command::Focus {
            output,
            input,
            rule,
        } => {
            let mut registry = ctx.registry.lock();
            if registry.input(&input).is_none() {
                return unknown("input", &input);
            }
            if registry.output(&output).is_none() {
                return unknown("output", &output);
            }
            report(registry.set_target_focus_rule(&output, &input, &rule));
        },
        Command::Save => {
            let document = RoutingDocument::from_registry(&ctx.registry.lock());
            match ctx.runtime.block_on(document.save_to_file(&ctx.routing_path)) {
                Ok(()) => println!("{} {}", "saved".green(), ctx.routing_path.display()),
                Err(e) => println!("{} {:#}", "error:".red().bold(), e),
            }
        },
        Command::Help => print_help(),
        Command::Quit => {},
    }
}

fn unknown(kind: &str, name: &str) {
    println!("{} unknown {} '{}'", "error:".red().bold(), kind, name);
}

fn report(result: Result<(), crate::error::EchoError>) {
    match result {
        Ok(()) => println!("{}", "ok".green()),
        Err(e) => println!("{}\n{}", "error:".red().bold(), format_error_chain(&e)),
    }
}

fn print_help() {
    println!("\n{}", "=== Commands ===".bold().cyan());
    let rows = [
        ("list", "show devices and routing"),
        ("sync", "rescan devices now"),
        ("echo <input> on|off", "enable or disable echo of an input"),
        ("send <output> <input> on|off", "unmute or mute an output for an input"),
        ("focus <output> <input> [rule]", "mute unless the rule's app has focus; no rule clears"),
        ("save", "write the routing file"),
        ("quit", "save (if enabled) and exit"),
    ];
    for (usage, what) in rows {
        println!("  {:<32} {}", usage.yellow(), what);
    }
    println!("  {}", "Quote names containing spaces: \"loopMIDI Port A\"".dimmed());
}

/// Print the registry: every input with its echo state and routing records
pub fn print_routing(registry: &Registry) {
    let outputs = registry.outputs();

    println!("\n{}", "=== MIDI Inputs ===".bold().cyan());
    let inputs = registry.inputs();
    if inputs.is_empty() {
        println!("  {}", "No input devices known".dimmed());
    }
    for input in inputs {
        let marker = if input.available {
            "[ONLINE] ".green()
        } else {
            "[OFFLINE]".dimmed()
        };
        let echo = match (input.echo_enabled, input.echoing) {
            (true, true) => "echo on".bright_green(),
            (true, false) => "echo pending".yellow(),
            _ => "echo off".dimmed(),
        };
        println!("  {} {} ({})", marker, input.name.bright_white(), echo);

        for output in &outputs {
            let rule = registry.focus_rule(&output.name, &input.name);
            if !output.mute.contains_key(&input.name) && rule.is_empty() {
                continue;
            }
            let state = if registry.is_muted(&output.name, &input.name) {
                "mute".dimmed()
            } else if registry.sends(&output.name, &input.name) {
                "send".green()
            } else if registry.target_state(&output.name, &input.name).is_some() {
                "send (focus muted)".yellow()
            } else {
                "send (offline)".dimmed()
            };
            if rule.is_empty() {
                println!("      -> {} [{}]", output.name, state);
            } else {
                println!("      -> {} [{}] focus: {}", output.name, state, rule.cyan());
            }
        }
    }

    println!("\n{}", "=== MIDI Outputs ===".bold().cyan());
    if outputs.is_empty() {
        println!("  {}", "No output devices known".dimmed());
    }
    for output in &outputs {
        let marker = if output.available {
            "[ONLINE] ".green()
        } else {
            "[OFFLINE]".dimmed()
        };
        println!("  {} {}", marker, output.name);
    }
}

/// Print the live port lists, for `--list-devices`
pub fn print_inventory(subsystem: &dyn DeviceSubsystem) -> Result<()> {
    let inventory = Inventory::capture(subsystem)?;

    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());
    for (title, ports) in [("Input Ports:", &inventory.inputs), ("Output Ports:", &inventory.outputs)] {
        println!("\n{}", title.bold());
        if ports.is_empty() {
            println!("  {}", "No ports found".dimmed());
        }
        let mut by_id: Vec<_> = ports.iter().collect();
        by_id.sort_by_key(|(_, id)| **id);
        for (name, id) in by_id {
            println!("  {} {}", format!("[{}]", id).yellow(), name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"send "loopMIDI Port A" Keystation on"#).unwrap(),
            vec!["send", "loopMIDI Port A", "Keystation", "on"]
        );
        assert_eq!(tokenize(r#"focus X A """#).unwrap(), vec!["focus", "X", "A", ""]);
        assert!(tokenize(r#"echo "unterminated"#).is_err());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(parse_command("LIST").unwrap(), Some(Command::List));
        assert_eq!(
            parse_command("echo Keystation on").unwrap(),
            Some(Command::Echo {
                input: "Keystation".into(),
                enabled: true
            })
        );
        assert_eq!(
            parse_command(r#"focus "Port B" Keys reaper"#).unwrap(),
            Some(Command::Focus {
                output: "Port B".into(),
                input: "Keys".into(),
                rule: "reaper".into()
            })
        );
        assert_eq!(
            parse_command("focus B Keys").unwrap(),
            Some(Command::Focus {
                output: "B".into(),
                input: "Keys".into(),
                rule: String::new()
            })
        );
        assert_eq!(parse_command("exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("echo Keystation maybe").is_err());
        assert!(parse_command("send A").is_err());
        assert!(parse_command("frobnicate").is_err());
    }
}
