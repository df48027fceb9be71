//! Interactive command input.
//!
//! One command per line: `<amount> <from> <to>` submits a transfer, `ledger`
//! prints balances, `peers` lists known peers and `quit` exits. The account
//! name `me` stands for this node's own account.

use crate::crypto::VerificationPolicy;
use crate::node::Node;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

pub const SELF_ALIAS: &str = "me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Transfer { amount: i64, from: String, to: String },
    Ledger,
    Peers,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("expected `<amount> <from> <to>`, got {0} field(s)")]
    FieldCount(usize),

    #[error("invalid amount {0:?}")]
    Amount(String),

    #[error("amount must be positive")]
    NonPositive,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, InputError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [] => Ok(None),
        ["quit"] | ["exit"] => Ok(Some(Command::Quit)),
        ["ledger"] => Ok(Some(Command::Ledger)),
        ["peers"] => Ok(Some(Command::Peers)),
        [amount, from, to] => {
            let amount: i64 = amount
                .parse()
                .map_err(|_| InputError::Amount(amount.to_string()))?;
            if amount <= 0 {
                return Err(InputError::NonPositive);
            }
            Ok(Some(Command::Transfer {
                amount,
                from: from.to_string(),
                to: to.to_string(),
            }))
        }
        other => Err(InputError::FieldCount(other.len())),
    }
}

fn resolve_account(name: String, own: &str) -> String {
    if name == SELF_ALIAS {
        own.to_string()
    } else {
        name
    }
}

/// Read commands until `quit` or end of input.
pub async fn run_input_loop<R>(node: &Node, reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let own = node.public_key();
    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };

        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("Ignoring input: {}", e);
                continue;
            }
        };

        match command {
            Command::Quit => break,
            Command::Ledger => {
                node.ledger().print_ledger();
            }
            Command::Peers => {
                info!("Known peers: {:?}", node.directory().peers());
            }
            Command::Transfer { amount, from, to } => {
                let from = resolve_account(from, &own);
                let to = resolve_account(to, &own);
                if node.verifier().policy() == VerificationPolicy::Sender && from != own {
                    warn!("Only this node's account ({}) can be debited here", own);
                    continue;
                }
                match node.transfer(amount, from, to).await {
                    Ok(disposition) => info!("Transfer submitted: {:?}", disposition),
                    Err(e) => error!("Failed to create transfer: {}", e),
                }
            }
        }
    }
}
