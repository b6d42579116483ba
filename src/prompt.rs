//! Agent prompt construction and reply parsing.

use crate::agent::AgentId;
use crate::collab::ChannelMessage;
use crate::core::TaskNode;

const SHELL_FENCES: &[&str] = &["sh", "bash", "shell", "zsh", "console"];

fn header(node: &TaskNode) -> String {
    format!(
        "Task {} ({}):\n{}\n",
        node.id,
        node.role,
        node.description.trim()
    )
}

fn messages_section(messages: &[ChannelMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = messages.iter().map(|m| format!("- {}", m)).collect();
    format!("\nMessages for you:\n{}\n", lines.join("\n"))
}

/// First prompt for an agent working on a collaborative node.
pub fn implementation(
    node: &TaskNode,
    agent: &AgentId,
    peers: &[AgentId],
    messages: &[ChannelMessage],
) -> String {
    let mut prompt = header(node);
    prompt.push_str(&format!(
        "\nYou are agent {}. Implement your part of this task by editing files in the current directory. \
         Your changes are committed when you finish.\n",
        agent
    ));
    if !peers.is_empty() {
        let names: Vec<&str> = peers.iter().map(AgentId::as_str).collect();
        prompt.push_str(&format!(
            "Other agents working on this task: {}. To send one of them a note, write a line of the form `@<agent-id>: <message>`.\n",
            names.join(", ")
        ));
    }
    prompt.push_str(&messages_section(messages));
    prompt
}

/// Prompt after the agent's change conflicted with the delivery line.
pub fn reimplement(
    node: &TaskNode,
    agent: &AgentId,
    conflict_files: &[String],
    messages: &[ChannelMessage],
) -> String {
    let mut prompt = header(node);
    prompt.push_str(&format!(
        "\nAgent {}, your previous change conflicted with work already integrated in: {}.\n\
         The current directory now contains the integrated state. Re-apply your part of the task on top of it.\n",
        agent,
        conflict_files.join(", ")
    ));
    prompt.push_str(&messages_section(messages));
    prompt
}

/// Prompt after validation of the agent's change failed.
pub fn fix(node: &TaskNode, agent: &AgentId, report: &str, messages: &[ChannelMessage]) -> String {
    let mut prompt = header(node);
    prompt.push_str(&format!(
        "\nAgent {}, your change was rolled back because validation failed:\n\n{}\n\nFix the problem in the current directory.\n",
        agent,
        report.trim()
    ));
    prompt.push_str(&messages_section(messages));
    prompt
}

/// Prompt for a node with a single agent working on the delivery line.
pub fn single(node: &TaskNode, commands: &[String]) -> String {
    let mut prompt = header(node);
    prompt.push_str(
        "\nWork in the current directory. If commands must be run afterwards (installs, builds, tests), \
         list them one per line in a ```sh fenced block.\n",
    );
    if !commands.is_empty() {
        prompt.push_str(&format!(
            "These commands will run after you finish:\n{}\n",
            commands
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }
    prompt
}

/// Commands listed in fenced shell blocks, one per line. Comment lines are
/// skipped and trailing-backslash continuations joined.
pub fn shell_commands(content: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut in_block = false;
    let mut pending = String::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(fence) = trimmed.strip_prefix("```") {
            if in_block {
                in_block = false;
                if !pending.is_empty() {
                    commands.push(std::mem::take(&mut pending));
                }
            } else {
                in_block = SHELL_FENCES.contains(&fence.trim());
            }
            continue;
        }
        if !in_block || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let command = trimmed.strip_prefix("$ ").unwrap_or(trimmed);
        match command.strip_suffix('\\') {
            Some(head) => {
                pending.push_str(head.trim_end());
                pending.push(' ');
            }
            None => {
                pending.push_str(command);
                commands.push(std::mem::take(&mut pending));
            }
        }
    }
    commands
}
