//! robots.txt rules for the HTML sources.

/// One `User-agent` group and its path rules.
#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    allow: Vec<String>,
    disallow: Vec<String>,
}

/// Parsed robots.txt. An empty or unreadable file allows everything.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    groups: Vec<Group>,
}

impl RobotsTxt {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    // Consecutive user-agent lines share one group.
                    if in_rules {
                        groups.push(std::mem::take(&mut current));
                        in_rules = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "allow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current.allow.push(value.to_string());
                    }
                }
                "disallow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current.disallow.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        Self { groups }
    }

    /// `path` includes the query string. The longest matching rule wins and
    /// `Allow` wins a tie.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|rule| rule_matches(rule, path))
                .map(|rule| rule.len())
                .max()
        };
        match (longest(&group.allow), longest(&group.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(disallow)) => allow >= disallow,
        }
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let product = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .trim()
            .to_ascii_lowercase();
        self.groups
            .iter()
            .find(|group| {
                group
                    .agents
                    .iter()
                    .any(|agent| agent != "*" && product.contains(agent.as_str()))
            })
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|group| group.agents.iter().any(|agent| agent == "*"))
            })
    }
}

/// Prefix match with `*` wildcards and an optional trailing `$` anchor.
fn rule_matches(rule: &str, path: &str) -> bool {
    let (rule, anchored) = match rule.strip_suffix('$') {
        Some(rule) => (rule, true),
        None => (rule, false),
    };
    let mut parts = rule.split('*');
    let Some(mut rest) = parts.next().and_then(|head| path.strip_prefix(head)) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    if tail.is_empty() {
        return !anchored || rest.is_empty();
    }
    for (index, part) in tail.iter().enumerate() {
        if anchored && index + 1 == tail.len() {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    true
}
