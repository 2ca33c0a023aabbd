//! Routing heuristics for workflows.
//!
//! Everything here is a pure function of the routing table, the
//! conversation, and the processed-message ledger, so the same inputs always
//! pick the same next agent.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use hive_core::types::Message;

use super::{TeamType, WorkflowType};

/// Agent name to the ids of messages that agent has already taken as input.
pub type ProcessedLedger = HashMap<String, Vec<String>>;

const ROUTING_KEYWORDS: &[&str] = &[
    "route to",
    "send to",
    "forward to",
    "delegate to",
    "assign to",
    "@",
];

const COMPLETION_KEYWORDS: &[&str] = &[
    "task complete",
    "completed",
    "finished",
    "done",
    "task accomplished",
    "objective achieved",
    "✓",
    "✔",
];

const FINAL_KEYWORDS: &[&str] = &[
    "final answer",
    "final response",
    "final solution",
    "final result",
    "end workflow",
    "complete workflow",
    "final:",
];

fn compile<T: Copy>(table: &[(&str, T)]) -> Vec<(Regex, T)> {
    table
        .iter()
        .filter_map(|(pattern, value)| Regex::new(pattern).ok().map(|re| (re, *value)))
        .collect()
}

fn routing_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)route to (\w+)",
            r"(?i)send to (\w+)",
            r"(?i)forward to (\w+)",
            r"(?i)delegate to (\w+)",
            r"(?i)assign to (\w+)",
            r"@(\w+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn team_patterns() -> &'static [(Regex, TeamType)] {
    static PATTERNS: OnceLock<Vec<(Regex, TeamType)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            (r"(?i)(research|search|find|look up|scrape|collect)", TeamType::Research),
            (r"(?i)(write|draft|compose|create|document|chart|generate)", TeamType::Document),
            (r"(?i)(analyze|evaluate|assess|interpret|review|investigate)", TeamType::Analysis),
            (r"(?i)(code|develop|implement|program|debug|test|build)", TeamType::Developer),
        ])
    })
}

fn function_patterns() -> &'static [(Regex, &'static [&'static str])] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static [&'static str])>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: &[(&str, &'static [&'static str])] = &[
            (r"(?i)(search|api)", &["searcher", "web_scraper"]),
            (r"(?i)(write|text)", &["writer", "note_taker"]),
            (r"(?i)(chart|graph|plot)", &["chart_generator"]),
            (r"(?i)(analyze|evaluate|assess)", &["analyzer", "evaluator"]),
            (r"(?i)(interpret|review|investigate)", &["reviewer", "investigator"]),
            (r"(?i)(code|program|implement)", &["developer", "programmer"]),
            (r"(?i)(test|debug|fix)", &["tester", "debugger"]),
            (r"(?i)(build|deploy|release)", &["builder", "deployer"]),
            (r"(?i)(optimize|refactor|improve)", &["optimizer", "refactorer"]),
        ];
        compile(table)
    })
}

fn contains_any(content: &str, keywords: &[&str]) -> bool {
    let lower = content.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

/// Agent named by an explicit instruction such as `route to writer` or
/// `@writer`. Known-ness is checked by the caller.
pub fn explicit_target(content: &str) -> Option<String> {
    if !contains_any(content, ROUTING_KEYWORDS) {
        return None;
    }
    let content = content.trim();
    routing_patterns()
        .iter()
        .find_map(|re| re.captures(content))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn is_task_complete(content: &str) -> bool {
    contains_any(content, COMPLETION_KEYWORDS)
}

pub fn is_final_answer(content: &str) -> bool {
    contains_any(content, FINAL_KEYWORDS)
}

/// First team, in fixed order, whose pattern matches the text.
pub fn classify_team(content: &str) -> Option<TeamType> {
    team_patterns()
        .iter()
        .find(|(re, _)| re.is_match(content))
        .map(|(_, team)| *team)
}

/// Stable id of a message: hex of the first 8 bytes of
/// `sha256("role:content")`.
pub fn message_id(message: &Message) -> String {
    let digest = Sha256::digest(format!("{}:{}", message.role.as_str(), message.content).as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Who is in the workflow and how they relate.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub workflow_type: WorkflowType,
    /// Agent names in insertion order.
    pub agents: Vec<String>,
    pub connections: HashMap<String, Vec<String>>,
    /// Team members in insertion order, teams in their fixed order.
    pub teams: BTreeMap<TeamType, Vec<String>>,
    pub leaders: HashMap<TeamType, String>,
}

impl RoutingTable {
    pub fn new(workflow_type: WorkflowType) -> Self {
        Self {
            workflow_type,
            ..Default::default()
        }
    }

    pub fn is_known(&self, agent: &str) -> bool {
        self.agents.iter().any(|a| a == agent)
    }

    fn team_of(&self, agent: &str) -> Option<TeamType> {
        self.teams
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == agent))
            .map(|(team, _)| *team)
    }

    /// Agent that should act next after `current` produced the tail of
    /// `messages`, or `None` when the workflow is done.
    pub fn next_agent(
        &self,
        current: &str,
        messages: &[Message],
        processed: &ProcessedLedger,
    ) -> Option<String> {
        let last = messages.last()?;

        if let Some(target) = explicit_target(&last.content) {
            if self.is_known(&target) {
                return Some(target);
            }
        }

        match self.workflow_type {
            WorkflowType::Supervisor => self.supervisor_route(current, last),
            WorkflowType::Hierarchical => self.hierarchical_route(current, last),
            WorkflowType::Collaborative => self.collaborative_route(current, last, processed),
        }
    }

    fn supervisor_route(&self, current: &str, last: &Message) -> Option<String> {
        let supervisor = self.leaders.get(&TeamType::Supervisor)?;
        if current != supervisor {
            return Some(supervisor.clone());
        }

        let content = last.content.to_lowercase();
        team_patterns()
            .iter()
            .filter(|(re, _)| re.is_match(&content))
            .find_map(|(_, team)| {
                self.leaders
                    .get(team)
                    .cloned()
                    .or_else(|| self.teams.get(team).and_then(|m| m.first().cloned()))
            })
    }

    fn hierarchical_route(&self, current: &str, last: &Message) -> Option<String> {
        if is_task_complete(&last.content) {
            if let Some(team) = self.team_of(current) {
                let target = self
                    .leaders
                    .get(&team)
                    .cloned()
                    .unwrap_or_else(|| "supervisor".to_string());
                return self.is_known(&target).then_some(target);
            }
        }

        if last.content.contains("function") || last.content.contains("tool") {
            return function_patterns()
                .iter()
                .filter(|(re, _)| re.is_match(&last.content))
                .flat_map(|(_, candidates)| candidates.iter())
                .find(|name| self.is_known(name))
                .map(|name| name.to_string());
        }

        None
    }

    fn collaborative_route(
        &self,
        current: &str,
        last: &Message,
        processed: &ProcessedLedger,
    ) -> Option<String> {
        if is_final_answer(&last.content) {
            return None;
        }

        let id = message_id(last);
        let unprocessed = |agent: &&String| {
            !processed
                .get(agent.as_str())
                .is_some_and(|ids| ids.iter().any(|seen| *seen == id))
        };

        let peers = self.connections.get(current).map(Vec::as_slice).unwrap_or(&[]);
        peers
            .iter()
            .find(unprocessed)
            .or_else(|| {
                self.agents
                    .iter()
                    .filter(|a| a.as_str() != current)
                    .find(unprocessed)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(kind: WorkflowType, agents: &[&str]) -> RoutingTable {
        let mut table = RoutingTable::new(kind);
        table.agents = agents.iter().map(|a| a.to_string()).collect();
        table
    }

    fn said(text: &str) -> Vec<Message> {
        vec![Message::user("start"), Message::assistant(text)]
    }

    #[test]
    fn test_explicit_target_patterns() {
        assert_eq!(explicit_target("Please route to Writer now").as_deref(), Some("Writer"));
        assert_eq!(explicit_target("cc @reviewer").as_deref(), Some("reviewer"));
        assert_eq!(explicit_target("no instructions here"), None);
    }

    #[test]
    fn test_explicit_instruction_needs_known_agent() {
        let table = table(WorkflowType::Collaborative, &["a", "writer"]);
        let ledger = ProcessedLedger::new();
        assert_eq!(
            table.next_agent("a", &said("send to writer"), &ledger).as_deref(),
            Some("writer")
        );
        // Unknown target falls back to the strategy; a final answer ends it.
        assert_eq!(table.next_agent("a", &said("send to ghost. Final answer: 4"), &ledger), None);
    }

    #[test]
    fn test_supervisor_classifies_in_fixed_order() {
        let mut table = table(WorkflowType::Supervisor, &["boss", "finder", "scribe", "coder"]);
        table.leaders.insert(TeamType::Supervisor, "boss".into());
        table.leaders.insert(TeamType::Research, "finder".into());
        table.teams.insert(TeamType::Document, vec!["scribe".into()]);
        table.teams.insert(TeamType::Developer, vec!["coder".into()]);
        let ledger = ProcessedLedger::new();

        // "find" (research) beats "write" (document).
        assert_eq!(
            table.next_agent("boss", &said("Find sources, then write it up"), &ledger).as_deref(),
            Some("finder")
        );
        // No document leader: first team member.
        assert_eq!(
            table.next_agent("boss", &said("Draft the summary"), &ledger).as_deref(),
            Some("scribe")
        );
        assert_eq!(table.next_agent("boss", &said("hello"), &ledger), None);
        // Workers always report back.
        assert_eq!(
            table.next_agent("coder", &said("implemented"), &ledger).as_deref(),
            Some("boss")
        );
    }

    #[test]
    fn test_hierarchical_completion_and_functions() {
        let mut table = table(WorkflowType::Hierarchical, &["lead", "analyzer", "writer"]);
        table.teams.insert(TeamType::Analysis, vec!["lead".into(), "analyzer".into()]);
        table.leaders.insert(TeamType::Analysis, "lead".into());
        let ledger = ProcessedLedger::new();

        assert_eq!(
            table.next_agent("analyzer", &said("Task complete ✓"), &ledger).as_deref(),
            Some("lead")
        );
        assert_eq!(
            table
                .next_agent("lead", &said("Use the text tool to write a draft"), &ledger)
                .as_deref(),
            Some("writer")
        );
        assert_eq!(table.next_agent("lead", &said("thinking"), &ledger), None);
        // Completion outside any team with no supervisor agent ends the run.
        assert_eq!(table.next_agent("writer", &said("done"), &ledger), None);
    }

    #[test]
    fn test_collaborative_visits_unprocessed_peers() {
        let mut table = table(WorkflowType::Collaborative, &["a", "b", "c"]);
        table.connections.insert("a".into(), vec!["b".into()]);
        let messages = said("draft v1");
        let id = message_id(messages.last().unwrap());

        let mut ledger = ProcessedLedger::new();
        assert_eq!(table.next_agent("a", &messages, &ledger).as_deref(), Some("b"));

        ledger.insert("b".into(), vec![id.clone()]);
        assert_eq!(table.next_agent("a", &messages, &ledger).as_deref(), Some("c"));

        ledger.insert("c".into(), vec![id]);
        assert_eq!(table.next_agent("a", &messages, &ledger), None);

        assert_eq!(
            table.next_agent("a", &said("FINAL: ship it"), &ProcessedLedger::new()),
            None
        );
    }

    #[test]
    fn test_message_id_is_stable() {
        let id = message_id(&Message::user("hello"));
        assert_eq!(id.len(), 16);
        assert_eq!(id, message_id(&Message::user("hello")));
        assert_ne!(id, message_id(&Message::assistant("hello")));
    }
}
