//! Command queue for multi-step operations.
//!
//! A command runs on every pump until it finishes. While the head command
//! waits for something outside (the audio server, an app exiting), commands
//! behind it wait too. Each command answers its caller exactly once.

use std::collections::VecDeque;

use greenproto::{Reply, RpcError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Waiting,
    Done,
    Failed,
}

/// Outcome of one run.
#[derive(Debug)]
pub enum Step {
    /// Not finished; run again on a later pump.
    Wait,
    Done(Reply),
}

pub trait Command<C>: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &mut C) -> Result<Step, RpcError>;
}

pub type ReplyTx = oneshot::Sender<Reply>;

struct Queued<C> {
    command: Box<dyn Command<C>>,
    state: CommandState,
    reply: Option<ReplyTx>,
}

impl<C> Queued<C> {
    fn answer(&mut self, reply: Reply) {
        if let Some(tx) = self.reply.take() {
            if tx.send(reply).is_err() {
                debug!(command = self.command.name(), "caller went away before the reply");
            }
        }
    }
}

pub struct CommandQueue<C> {
    commands: VecDeque<Queued<C>>,
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandQueue<C> {
    pub fn new() -> Self {
        Self {
            commands: VecDeque::new(),
        }
    }

    pub fn push(&mut self, command: Box<dyn Command<C>>, reply: Option<ReplyTx>) {
        debug!(command = command.name(), queued = self.commands.len(), "command queued");
        self.commands.push_back(Queued {
            command,
            state: CommandState::Pending,
            reply,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// State of the head command.
    pub fn head_state(&self) -> Option<CommandState> {
        self.commands.front().map(|q| q.state)
    }

    /// Run commands from the head until one waits or the queue drains.
    pub fn pump(&mut self, ctx: &mut C) {
        while let Some(head) = self.commands.front_mut() {
            match head.command.run(ctx) {
                Ok(Step::Wait) => {
                    if head.state != CommandState::Waiting {
                        debug!(command = head.command.name(), "command waiting");
                    }
                    head.state = CommandState::Waiting;
                    return;
                }
                Ok(Step::Done(reply)) => {
                    head.state = CommandState::Done;
                    debug!(command = head.command.name(), "command done");
                    head.answer(reply);
                    self.commands.pop_front();
                }
                Err(e) => {
                    head.state = CommandState::Failed;
                    error!(command = head.command.name(), "command failed: {}", e.message);
                    let name = head.command.name();
                    head.answer(Reply::from(e));
                    self.commands.pop_front();
                    self.cancel(&format!("cancelled after {} failed", name));
                    return;
                }
            }
        }
    }

    /// Fail every queued command with `reason`.
    pub fn cancel(&mut self, reason: &str) {
        for mut queued in self.commands.drain(..) {
            warn!(command = queued.command.name(), "{}", reason);
            queued.state = CommandState::Failed;
            queued.answer(Reply::from(RpcError::generic(reason)));
        }
    }
}
