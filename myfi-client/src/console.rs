use crate::contacts::HttpContactDirectory;
use crate::history::CallLog;
use anyhow::Context;
use myfi_call::{
    CallDirection, CallHandle, CallObserver, CallSnapshot, CallState, EndReason, format_duration,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const HELP: &str = "\
Commands:
  call <user id>   start a call
  accept           answer the incoming call
  reject           decline the incoming call
  hangup           end the current call
  mute             toggle the microphone
  status           show the current call
  contacts         list callable contacts
  history          list recent calls
  quit             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Accept,
    Reject,
    HangUp,
    Mute,
    Status,
    Contacts,
    History,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let command = parts.next().ok_or_else(|| "empty command".to_string())?;

        let parsed = match command.to_ascii_lowercase().as_str() {
            "call" => {
                let peer_id = parts.next().ok_or_else(|| "usage: call <user id>".to_string())?;
                Command::Call(peer_id.to_string())
            }
            "accept" | "answer" => Command::Accept,
            "reject" | "decline" => Command::Reject,
            "hangup" | "hang_up" | "end" => Command::HangUp,
            "mute" => Command::Mute,
            "status" => Command::Status,
            "contacts" => Command::Contacts,
            "history" => Command::History,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };

        if parts.next().is_some() {
            return Err(format!("too many arguments for '{command}'"));
        }
        Ok(parsed)
    }
}

/// Prints call progress to stdout.
pub struct ConsoleObserver;

impl CallObserver for ConsoleObserver {
    fn on_state_change(&self, state: CallState, session: Option<&CallSnapshot>) {
        match (state, session) {
            (CallState::OutgoingPending, Some(session)) => {
                println!("Calling {}...", session.display_name());
            }
            (CallState::Connecting, Some(session)) => {
                println!("Connecting to {}...", session.display_name());
            }
            (CallState::Active, Some(session)) => {
                println!("In call with {}", session.display_name());
            }
            (CallState::Ended, Some(session)) => {
                let duration = session.elapsed().map(format_duration);
                println!(
                    "Call with {} ended ({}){}",
                    session.display_name(),
                    session
                        .end_reason
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "ended".to_string()),
                    duration.map(|d| format!(" after {d}")).unwrap_or_default()
                );
            }
            _ => {}
        }
    }

    fn on_incoming_call(&self, session: &CallSnapshot) {
        println!(
            "Incoming call from {}. Type 'accept' or 'reject'.",
            session.display_name()
        );
    }

    fn on_error(&self, kind: &EndReason, message: &str) {
        tracing::debug!(?kind, "Call failed");
        println!("Call failed: {message}");
    }
}

/// Line-oriented front end driving the call manager from stdin.
pub struct Console {
    calls: CallHandle,
    directory: Option<Arc<HttpContactDirectory>>,
    history: Arc<CallLog>,
}

impl Console {
    pub fn new(
        calls: CallHandle,
        directory: Option<Arc<HttpContactDirectory>>,
        history: Arc<CallLog>,
    ) -> Self {
        Self {
            calls,
            directory,
            history,
        }
    }

    /// Reads commands until `quit`, end of input or shutdown.
    pub async fn run(&self, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        println!("{HELP}");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => break,
                line = lines.next_line() => line.context("Failed to read from stdin")?,
            };
            let Some(line) = line else {
                tracing::debug!("Reached end of input");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<Command>() {
                Ok(Command::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(err) => println!("{err}"),
            }
        }

        Ok(())
    }

    async fn execute(&self, command: Command) {
        tracing::trace!(?command, "Executing console command");
        let result = match command {
            Command::Call(peer_id) => self.calls.initiate(peer_id).await,
            Command::Accept => self.calls.accept().await,
            Command::Reject => self.calls.reject().await,
            Command::HangUp => self.calls.hang_up().await,
            Command::Mute => self.calls.toggle_mute().await.map(|muted| {
                println!("{}", if muted { "Muted" } else { "Unmuted" });
            }),
            Command::Status => {
                self.print_status();
                Ok(())
            }
            Command::Contacts => {
                self.print_contacts().await;
                Ok(())
            }
            Command::History => {
                self.print_history();
                Ok(())
            }
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => Ok(()),
        };

        if let Err(err) = result {
            println!("{err}");
        }
    }

    fn print_status(&self) {
        match self.calls.snapshot() {
            None => println!("No call"),
            Some(snapshot) => {
                let elapsed = snapshot
                    .elapsed()
                    .map(|elapsed| format!(" {}", format_duration(elapsed)))
                    .unwrap_or_default();
                println!(
                    "{} call with {}: {}{}{}",
                    match snapshot.direction {
                        CallDirection::Outgoing => "Outgoing",
                        CallDirection::Incoming => "Incoming",
                    },
                    snapshot.display_name(),
                    snapshot.state,
                    elapsed,
                    if snapshot.muted { " (muted)" } else { "" }
                );
            }
        }
    }

    async fn print_contacts(&self) {
        let Some(directory) = &self.directory else {
            println!("Contacts are not available");
            return;
        };

        match directory.contacts().await {
            Ok(contacts) if contacts.is_empty() => println!("No contacts"),
            Ok(contacts) => {
                for contact in contacts {
                    println!(
                        "{:<12} {:<24} {}",
                        contact.id,
                        contact.display_name,
                        if contact.online { "online" } else { "offline" }
                    );
                }
            }
            Err(err) => println!("Failed to load contacts: {err:#}"),
        }
    }

    fn print_history(&self) {
        let records = self.history.recent();
        if records.is_empty() {
            println!("No calls yet");
        }
        for record in records {
            println!(
                "{:<12} {:?} {:?} {}",
                record.peer_identity,
                record.direction,
                record.status,
                format_duration(Duration::from_secs(record.duration_seconds))
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_commands() {
        assert_eq!("call 42".parse(), Ok(Command::Call("42".to_string())));
        assert_eq!("  ACCEPT ".parse(), Ok(Command::Accept));
        assert_eq!("hangup".parse(), Ok(Command::HangUp));
        assert_eq!("quit".parse(), Ok(Command::Quit));
    }

    #[test]
    fn reject_malformed_commands() {
        assert!("call".parse::<Command>().is_err());
        assert!("call 42 43".parse::<Command>().is_err());
        assert!("dial 42".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }
}
