//! Netfilter rules through the `iptables` binary.

use std::time::Duration;

use ipnet::IpNet;
use rol_common::{RolError, RolResult};
use tokio::process::Command;

use crate::rule::{Table, TrafficRule};

/// Default binary; resolved through `PATH`.
pub const DEFAULT_IPTABLES: &str = "iptables";

/// Runs `iptables` with a bounded wait per invocation.
#[derive(Debug, Clone)]
pub(crate) struct Iptables {
    binary: String,
    timeout: Duration,
}

impl Iptables {
    pub(crate) fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub(crate) fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[String]) -> RolResult<String> {
        let operation = format!("{} {}", self.binary, args.join(" "));
        tracing::trace!(command = %operation, "Running iptables");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            RolError::io_failure(&operation, format!("timed out after {:?}", self.timeout))
        })?
        .map_err(|e| RolError::io_failure(&operation, e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&operation, stderr.trim()))
        }
    }

    fn rule_args(table: Table, action: &str, rule: &TrafficRule) -> RolResult<Vec<String>> {
        let v6 = [rule.source, rule.destination]
            .iter()
            .flatten()
            .any(|net| matches!(net, IpNet::V6(_)));
        if v6 {
            return Err(RolError::validation(
                "rule",
                format!("{rule}: iptables handles IPv4 networks only"),
            ));
        }
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.to_string(),
            action.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.match_args());
        Ok(args)
    }

    pub(crate) async fn append(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        self.run(&Self::rule_args(table, "-A", rule)?).await.map(drop)
    }

    pub(crate) async fn delete(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        self.run(&Self::rule_args(table, "-D", rule)?)
            .await
            .map(drop)
            .map_err(|e| {
                if e.is_not_found() {
                    RolError::not_found("traffic rule", format!("{table} {rule}"))
                } else {
                    e
                }
            })
    }

    pub(crate) async fn list(&self, table: Table, chain: Option<&str>) -> RolResult<Vec<TrafficRule>> {
        let mut args = vec!["-w".to_string(), "-t".to_string(), table.to_string(), "-S".to_string()];
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }
        let output = self.run(&args).await?;
        Ok(parse_rules(&output))
    }
}

fn classify_failure(operation: &str, stderr: &str) -> RolError {
    if stderr.contains("does a matching rule exist") || stderr.contains("No chain/target/match by that name") {
        RolError::not_found("traffic rule", operation)
    } else {
        RolError::io_failure(operation, stderr)
    }
}

/// Parse `iptables -S` output.
///
/// Policy (`-P`) and chain (`-N`) lines are skipped, as are rules using
/// matches other than source, destination and a bare jump target.
pub(crate) fn parse_rules(output: &str) -> Vec<TrafficRule> {
    output
        .lines()
        .filter_map(|line| {
            let rule = parse_rule(line);
            if rule.is_none() && line.starts_with("-A ") {
                tracing::trace!(line, "Skipping rule outside the supported shape");
            }
            rule
        })
        .collect()
}

fn parse_rule(line: &str) -> Option<TrafficRule> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "-A" {
        return None;
    }
    let mut rule = TrafficRule::new(tokens.next()?, "");
    while let Some(token) = tokens.next() {
        match token {
            "-s" => rule.source = Some(tokens.next()?.parse().ok()?),
            "-d" => rule.destination = Some(tokens.next()?.parse().ok()?),
            "-j" => rule.target = tokens.next()?.to_string(),
            _ => return None,
        }
    }
    (!rule.target.is_empty()).then_some(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing() {
        let output = "\
-P POSTROUTING ACCEPT
-N DOCKER
-A POSTROUTING -s 10.10.10.0/24 -j MASQUERADE
-A FORWARD -d 192.168.1.0/24 -j DROP
-A PREROUTING -p tcp --dport 80 -j DNAT --to-destination 10.0.0.2:80
-A FORWARD -j ACCEPT
";
        let rules = parse_rules(output);
        assert_eq!(
            rules,
            vec![
                TrafficRule::masquerade("10.10.10.0/24".parse().unwrap()),
                TrafficRule::new("FORWARD", "DROP").to("192.168.1.0/24".parse().unwrap()),
                TrafficRule::new("FORWARD", "ACCEPT"),
            ]
        );
    }

    #[test]
    fn listed_rule_matches_request_with_host_bits() {
        let requested = TrafficRule::parse("FORWARD", "ACCEPT", "10.0.0.1/8", "").unwrap();
        let listed = parse_rules("-A FORWARD -s 10.0.0.0/8 -j ACCEPT\n");
        assert_eq!(listed, vec![requested]);
    }

    #[test]
    fn rule_arguments() {
        let rule = TrafficRule::masquerade("10.10.10.0/24".parse().unwrap());
        let args = Iptables::rule_args(Table::Nat, "-D", &rule).unwrap();
        assert_eq!(
            args,
            vec!["-w", "-t", "nat", "-D", "POSTROUTING", "-s", "10.10.10.0/24", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn ipv6_rules_are_rejected() {
        let rule = TrafficRule::new("FORWARD", "ACCEPT").from("fd00::/64".parse().unwrap());
        assert!(Iptables::rule_args(Table::Filter, "-A", &rule).is_err());
    }

    #[test]
    fn missing_rule_is_not_found() {
        let err = classify_failure(
            "iptables -D",
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        assert!(err.is_not_found());
        let err = classify_failure("iptables -A", "Permission denied (you must be root)");
        assert_eq!(err.kind(), rol_common::ErrorKind::IoFailure);
    }
}
