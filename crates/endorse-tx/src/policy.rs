//! Signature-policy parsing, normalization, and evaluation.
//!
//! Policies are written in the textual signature-policy form used by channel
//! configuration, for example `AND('Org1MSP.member', 'Org2MSP.member')` or
//! `OutOf(2, 'Org1MSP.peer', 'Org2MSP.peer', 'Org3MSP.peer')`.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// Upper bound used by [`Policy::org_groups`] when callers have no better cap.
pub const DEFAULT_MAX_ORG_GROUPS: usize = 4_096;

/// Role a principal must hold inside its organization.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PrincipalRole {
    /// Any identity issued by the organization.
    Member,
    /// A peer node identity.
    Peer,
    /// An administrator identity.
    Admin,
    /// A client identity.
    Client,
    /// An ordering node identity.
    Orderer,
}

impl PrincipalRole {
    /// Returns true when a peer endorsement can satisfy this role.
    #[must_use]
    pub const fn satisfiable_by_peer(self) -> bool {
        matches!(self, Self::Member | Self::Peer)
    }

    /// Returns the lower-case DSL keyword for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Peer => "peer",
            Self::Admin => "admin",
            Self::Client => "client",
            Self::Orderer => "orderer",
        }
    }
}

impl FromStr for PrincipalRole {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "member" => Ok(Self::Member),
            "peer" => Ok(Self::Peer),
            "admin" => Ok(Self::Admin),
            "client" => Ok(Self::Client),
            "orderer" => Ok(Self::Orderer),
            _ => Err(PolicyError::UnknownRole {
                role: value.to_owned(),
            }),
        }
    }
}

/// Organization principal referenced by a policy leaf.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Principal {
    /// Membership-service-provider identifier of the organization.
    pub msp_id: String,
    /// Minimum role required.
    pub role: PrincipalRole,
}

/// Normalized endorsement policy tree.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Policy {
    /// One organization principal must sign.
    Principal(Principal),
    /// Every child must be satisfied.
    AllOf(Vec<Policy>),
    /// At least `required` children must be satisfied.
    OutOf {
        /// Number of children that must be satisfied.
        required: usize,
        /// Candidate children.
        rules: Vec<Policy>,
    },
}

/// Policy parsing and expansion errors.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PolicyError {
    /// Policy bytes were empty or whitespace.
    #[error("policy is empty")]
    Empty,
    /// Policy bytes were not valid UTF-8.
    #[error("policy is not valid utf-8")]
    NotUtf8,
    /// Input ended while more tokens were expected.
    #[error("unexpected end of policy, expected {expected}")]
    UnexpectedEnd {
        /// What the parser was looking for.
        expected: &'static str,
    },
    /// A token appeared where it is not allowed.
    #[error("unexpected `{found}` at offset {offset}, expected {expected}")]
    UnexpectedToken {
        /// Byte offset of the token.
        offset: usize,
        /// Token text.
        found: String,
        /// What the parser was looking for.
        expected: &'static str,
    },
    /// Operator name is not one of `AND`, `OR`, `OutOf`.
    #[error("unknown policy operator `{name}`")]
    UnknownOperator {
        /// Operator text.
        name: String,
    },
    /// Principal role is not recognized.
    #[error("unknown principal role `{role}`")]
    UnknownRole {
        /// Role text.
        role: String,
    },
    /// Principal text is not of the form `MSPID.role`.
    #[error("malformed principal `{principal}`")]
    MalformedPrincipal {
        /// Principal text.
        principal: String,
    },
    /// `OutOf` threshold is not a non-negative integer.
    #[error("invalid OutOf threshold `{value}`")]
    InvalidThreshold {
        /// Threshold text.
        value: String,
    },
    /// `OutOf` asks for more children than it has.
    #[error("policy requires {required} of {available} rules and can never be satisfied")]
    Unsatisfiable {
        /// Threshold.
        required: usize,
        /// Number of children.
        available: usize,
    },
    /// Group expansion exceeded the configured cap.
    #[error("policy expands to more than {limit} organization groups")]
    TooManyGroups {
        /// Configured cap.
        limit: usize,
    },
}

impl Policy {
    /// Parses and normalizes a textual policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when the text is malformed or unsatisfiable.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(PolicyError::Empty);
        }
        let mut parser = Parser {
            tokens: &tokens,
            cursor: 0,
        };
        let policy = parser.parse_expr()?;
        if let Some(extra) = parser.peek() {
            return Err(PolicyError::UnexpectedToken {
                offset: extra.offset,
                found: extra.kind.to_string(),
                expected: "end of policy",
            });
        }
        Ok(policy.normalized())
    }

    /// Parses raw policy bytes as fetched from the network.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotUtf8`] for non-UTF-8 bytes, otherwise as [`Self::parse`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PolicyError> {
        let text = std::str::from_utf8(bytes).map_err(|_| PolicyError::NotUtf8)?;
        Self::parse(text)
    }

    /// Creates a leaf requiring a member of `msp_id`.
    #[must_use]
    pub fn member(msp_id: impl Into<String>) -> Self {
        Self::Principal(Principal {
            msp_id: msp_id.into(),
            role: PrincipalRole::Member,
        })
    }

    /// Combines policies with logical AND.
    #[must_use]
    pub fn all_of(policies: Vec<Self>) -> Self {
        Self::AllOf(policies).normalized()
    }

    /// Returns the normalized form of this tree.
    ///
    /// Nested `AllOf` nodes are flattened, `OutOf(n)` with `n` equal to the child
    /// count becomes `AllOf`, and single-child nodes collapse into the child.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Principal(principal) => Self::Principal(principal),
            Self::AllOf(rules) => {
                let mut flat = Vec::with_capacity(rules.len());
                for rule in rules {
                    match rule.normalized() {
                        Self::AllOf(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.pop().unwrap_or(Self::AllOf(Vec::new()))
                } else {
                    Self::AllOf(flat)
                }
            }
            Self::OutOf { required, rules } => {
                let rules: Vec<Self> = rules.into_iter().map(Self::normalized).collect();
                if required > 0 && required == rules.len() {
                    Self::AllOf(rules).normalized()
                } else {
                    Self::OutOf { required, rules }
                }
            }
        }
    }

    /// Evaluates the policy against the organizations represented in a peer group.
    #[must_use]
    pub fn satisfied_by(&self, orgs: &BTreeSet<String>) -> bool {
        match self {
            Self::Principal(principal) => {
                principal.role.satisfiable_by_peer() && orgs.contains(&principal.msp_id)
            }
            Self::AllOf(rules) => rules.iter().all(|rule| rule.satisfied_by(orgs)),
            Self::OutOf { required, rules } => {
                rules.iter().filter(|rule| rule.satisfied_by(orgs)).count() >= *required
            }
        }
    }

    /// Returns every organization named anywhere in the tree.
    #[must_use]
    pub fn organizations(&self) -> BTreeSet<String> {
        let mut orgs = BTreeSet::new();
        self.collect_organizations(&mut orgs);
        orgs
    }

    fn collect_organizations(&self, orgs: &mut BTreeSet<String>) {
        match self {
            Self::Principal(principal) => {
                let _ = orgs.insert(principal.msp_id.clone());
            }
            Self::AllOf(rules) | Self::OutOf { rules, .. } => {
                for rule in rules {
                    rule.collect_organizations(orgs);
                }
            }
        }
    }

    /// Expands the policy into the distinct organization sets that satisfy it.
    ///
    /// Each returned set is a candidate endorsement group: one peer from each of its
    /// organizations jointly satisfies the policy. Sets come back in a stable order.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::TooManyGroups`] when any intermediate expansion exceeds `limit`.
    pub fn org_groups(&self, limit: usize) -> Result<Vec<BTreeSet<String>>, PolicyError> {
        Ok(self.expand(limit.max(1))?.into_iter().collect())
    }

    fn expand(&self, limit: usize) -> Result<BTreeSet<BTreeSet<String>>, PolicyError> {
        match self {
            Self::Principal(principal) => {
                let mut groups = BTreeSet::new();
                if principal.role.satisfiable_by_peer() {
                    let _ = groups.insert(BTreeSet::from([principal.msp_id.clone()]));
                }
                Ok(groups)
            }
            Self::AllOf(rules) => {
                let expanded = rules
                    .iter()
                    .map(|rule| rule.expand(limit))
                    .collect::<Result<Vec<_>, _>>()?;
                product(&expanded, limit)
            }
            Self::OutOf { required, rules } => {
                if *required == 0 {
                    return Ok(BTreeSet::from([BTreeSet::new()]));
                }
                let expanded = rules
                    .iter()
                    .map(|rule| rule.expand(limit))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut groups = BTreeSet::new();
                for combination in combinations(expanded.len(), *required) {
                    let chosen: Vec<BTreeSet<BTreeSet<String>>> = combination
                        .iter()
                        .filter_map(|index| expanded.get(*index).cloned())
                        .collect();
                    groups.extend(product(&chosen, limit)?);
                    if groups.len() > limit {
                        return Err(PolicyError::TooManyGroups { limit });
                    }
                }
                Ok(groups)
            }
        }
    }
}

impl FromStr for Policy {
    type Err = PolicyError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Principal(principal) => {
                write!(f, "'{}.{}'", principal.msp_id, principal.role.as_str())
            }
            Self::AllOf(rules) => {
                f.write_str("AND(")?;
                write_rules(f, rules)?;
                f.write_str(")")
            }
            Self::OutOf { required, rules } => {
                write!(f, "OutOf({required}")?;
                if !rules.is_empty() {
                    f.write_str(", ")?;
                }
                write_rules(f, rules)?;
                f.write_str(")")
            }
        }
    }
}

fn write_rules(f: &mut fmt::Formatter<'_>, rules: &[Policy]) -> fmt::Result {
    for (index, rule) in rules.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{rule}")?;
    }
    Ok(())
}

/// Cartesian union of group sets: every way of picking one group from each input.
fn product(
    inputs: &[BTreeSet<BTreeSet<String>>],
    limit: usize,
) -> Result<BTreeSet<BTreeSet<String>>, PolicyError> {
    let mut acc: BTreeSet<BTreeSet<String>> = BTreeSet::from([BTreeSet::new()]);
    for input in inputs {
        let mut next = BTreeSet::new();
        for partial in &acc {
            for group in input {
                let mut merged = partial.clone();
                merged.extend(group.iter().cloned());
                let _ = next.insert(merged);
                if next.len() > limit {
                    return Err(PolicyError::TooManyGroups { limit });
                }
            }
        }
        acc = next;
        if acc.is_empty() {
            break;
        }
    }
    Ok(acc)
}

/// All `k`-element index subsets of `0..n`, in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    if k > n {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        out.push(indices.clone());
        let mut position = k;
        let advanced = loop {
            if position == 0 {
                break false;
            }
            position -= 1;
            if indices[position] < n - k + position {
                break true;
            }
        };
        if !advanced {
            return out;
        }
        indices[position] += 1;
        for later in position + 1..k {
            indices[later] = indices[later - 1] + 1;
        }
    }
}

/// Lexical token kinds.
#[derive(Debug, Clone, Eq, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(String),
    Quoted(String),
    Open,
    Close,
    Comma,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(text) | Self::Number(text) => f.write_str(text),
            Self::Quoted(text) => write!(f, "'{text}'"),
            Self::Open => f.write_str("("),
            Self::Close => f.write_str(")"),
            Self::Comma => f.write_str(","),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, PolicyError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        let kind = match ch {
            c if c.is_whitespace() => continue,
            '(' => TokenKind::Open,
            ')' => TokenKind::Close,
            ',' => TokenKind::Comma,
            '\'' | '"' => {
                let mut value = String::new();
                let mut closed = false;
                for (_, next) in chars.by_ref() {
                    if next == ch {
                        closed = true;
                        break;
                    }
                    value.push(next);
                }
                if !closed {
                    return Err(PolicyError::UnexpectedEnd {
                        expected: "closing quote",
                    });
                }
                TokenKind::Quoted(value)
            }
            c if c.is_ascii_digit() => {
                let mut value = String::from(c);
                while let Some((_, next)) = chars.peek().copied()
                    && next.is_ascii_digit()
                {
                    value.push(next);
                    let _ = chars.next();
                }
                TokenKind::Number(value)
            }
            c if c.is_ascii_alphabetic() => {
                let mut value = String::from(c);
                while let Some((_, next)) = chars.peek().copied()
                    && (next.is_ascii_alphanumeric() || next == '_')
                {
                    value.push(next);
                    let _ = chars.next();
                }
                TokenKind::Ident(value)
            }
            other => {
                return Err(PolicyError::UnexpectedToken {
                    offset,
                    found: other.to_string(),
                    expected: "operator, principal, or punctuation",
                });
            }
        };
        tokens.push(Token { kind, offset });
    }
    Ok(tokens)
}

struct Parser<'tokens> {
    tokens: &'tokens [Token],
    cursor: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, PolicyError> {
        let token = self
            .tokens
            .get(self.cursor)
            .cloned()
            .ok_or(PolicyError::UnexpectedEnd { expected })?;
        self.cursor = self.cursor.saturating_add(1);
        Ok(token)
    }

    fn expect(&mut self, kind: &TokenKind, expected: &'static str) -> Result<(), PolicyError> {
        let token = self.next(expected)?;
        if token.kind == *kind {
            Ok(())
        } else {
            Err(PolicyError::UnexpectedToken {
                offset: token.offset,
                found: token.kind.to_string(),
                expected,
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Policy, PolicyError> {
        let token = self.next("operator or principal")?;
        match token.kind {
            TokenKind::Quoted(text) => parse_principal(&text),
            TokenKind::Ident(name) => {
                self.expect(&TokenKind::Open, "`(`")?;
                match name.to_ascii_lowercase().as_str() {
                    "and" => Ok(Policy::AllOf(self.parse_rules()?)),
                    "or" => Ok(Policy::OutOf {
                        required: 1,
                        rules: self.parse_rules()?,
                    }),
                    "outof" => {
                        let required = self.parse_threshold()?;
                        self.expect(&TokenKind::Comma, "`,`")?;
                        let rules = self.parse_rules()?;
                        if required > rules.len() {
                            return Err(PolicyError::Unsatisfiable {
                                required,
                                available: rules.len(),
                            });
                        }
                        Ok(Policy::OutOf { required, rules })
                    }
                    _ => Err(PolicyError::UnknownOperator { name }),
                }
            }
            other => Err(PolicyError::UnexpectedToken {
                offset: token.offset,
                found: other.to_string(),
                expected: "operator or principal",
            }),
        }
    }

    fn parse_threshold(&mut self) -> Result<usize, PolicyError> {
        let token = self.next("OutOf threshold")?;
        let text = match &token.kind {
            TokenKind::Number(text) | TokenKind::Quoted(text) => text.trim().to_owned(),
            other => {
                return Err(PolicyError::InvalidThreshold {
                    value: other.to_string(),
                });
            }
        };
        text.parse::<usize>()
            .map_err(|_| PolicyError::InvalidThreshold { value: text })
    }

    /// Parses `expr (',' expr)* ')'`.
    fn parse_rules(&mut self) -> Result<Vec<Policy>, PolicyError> {
        let mut rules = vec![self.parse_expr()?];
        loop {
            let token = self.next("`,` or `)`")?;
            match token.kind {
                TokenKind::Comma => rules.push(self.parse_expr()?),
                TokenKind::Close => return Ok(rules),
                other => {
                    return Err(PolicyError::UnexpectedToken {
                        offset: token.offset,
                        found: other.to_string(),
                        expected: "`,` or `)`",
                    });
                }
            }
        }
    }
}

fn parse_principal(text: &str) -> Result<Policy, PolicyError> {
    let text = text.trim();
    let (msp_id, role) = match text.rsplit_once('.') {
        Some((msp_id, role)) => (msp_id, role.parse::<PrincipalRole>()?),
        None => (text, PrincipalRole::Member),
    };
    if msp_id.is_empty() {
        return Err(PolicyError::MalformedPrincipal {
            principal: text.to_owned(),
        });
    }
    Ok(Policy::Principal(Principal {
        msp_id: msp_id.to_owned(),
        role,
    }))
}

/// Returns the organizations of `groups` that appear in no group satisfiable by `available`.
#[must_use]
pub fn missing_organizations(
    groups: &[BTreeSet<String>],
    available: &HashSet<String>,
) -> BTreeSet<String> {
    groups
        .iter()
        .flat_map(|group| group.iter())
        .filter(|org| !available.contains(*org))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orgs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn parses_and_of_members() {
        let policy = Policy::parse("AND('Org1MSP.member','Org2MSP.member')");
        assert!(policy.is_ok());
        if let Ok(policy) = policy {
            assert_eq!(
                policy,
                Policy::AllOf(vec![Policy::member("Org1MSP"), Policy::member("Org2MSP")])
            );
            assert!(policy.satisfied_by(&orgs(&["Org1MSP", "Org2MSP"])));
            assert!(!policy.satisfied_by(&orgs(&["Org1MSP"])));
        }
    }

    #[test]
    fn or_becomes_one_of_and_full_outof_becomes_all_of() {
        let or = Policy::parse("or(\"A.peer\", \"B.peer\")");
        assert!(matches!(or, Ok(Policy::OutOf { required: 1, .. })));

        let full = Policy::parse("OutOf(2, 'A.member', 'B.member')");
        assert!(matches!(full, Ok(Policy::AllOf(ref rules)) if rules.len() == 2));

        let quoted_threshold = Policy::parse("OutOf('1', 'A.member', 'B.member')");
        assert!(matches!(quoted_threshold, Ok(Policy::OutOf { required: 1, .. })));
    }

    #[test]
    fn nested_and_is_flattened_and_single_child_collapses() {
        let policy = Policy::parse("AND(AND('A.member'), AND('B.member', 'C.member'))");
        assert!(policy.is_ok());
        if let Ok(Policy::AllOf(rules)) = policy {
            assert_eq!(rules.len(), 3);
        } else {
            panic!("expected flattened AllOf");
        }
        assert_eq!(Policy::parse("OR('A.member')"), Ok(Policy::member("A")));
    }

    #[test]
    fn rejects_malformed_policies() {
        assert_eq!(Policy::parse("   "), Err(PolicyError::Empty));
        assert!(matches!(
            Policy::parse("XOR('A.member')"),
            Err(PolicyError::UnknownOperator { .. })
        ));
        assert!(matches!(
            Policy::parse("AND('A.member'"),
            Err(PolicyError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            Policy::parse("AND('A.wizard')"),
            Err(PolicyError::UnknownRole { .. })
        ));
        assert!(matches!(
            Policy::parse("OutOf(3, 'A.member', 'B.member')"),
            Err(PolicyError::Unsatisfiable {
                required: 3,
                available: 2
            })
        ));
        assert!(matches!(
            Policy::parse("AND('A.member') extra"),
            Err(PolicyError::UnexpectedToken { .. })
        ));
        assert_eq!(Policy::from_bytes(&[0xff, 0xfe]), Err(PolicyError::NotUtf8));
    }

    #[test]
    fn admin_principals_are_not_satisfied_by_peers() {
        let policy = Policy::parse("AND('A.admin')");
        assert!(policy.is_ok());
        if let Ok(policy) = policy {
            assert!(!policy.satisfied_by(&orgs(&["A"])));
            assert_eq!(policy.org_groups(16), Ok(Vec::new()));
        }
    }

    #[test]
    fn two_of_three_expands_into_three_groups() {
        let policy = Policy::parse("OutOf(2, 'A.member', 'B.member', 'C.member')");
        assert!(policy.is_ok());
        if let Ok(policy) = policy {
            let groups = policy.org_groups(DEFAULT_MAX_ORG_GROUPS);
            assert_eq!(
                groups,
                Ok(vec![orgs(&["A", "B"]), orgs(&["A", "C"]), orgs(&["B", "C"])])
            );
            if let Ok(groups) = groups {
                for group in &groups {
                    assert!(policy.satisfied_by(group));
                }
            }
        }
    }

    #[test]
    fn combined_policies_merge_groups() {
        let first = Policy::parse("OR('A.member', 'B.member')");
        let second = Policy::parse("AND('C.member')");
        assert!(first.is_ok() && second.is_ok());
        if let (Ok(first), Ok(second)) = (first, second) {
            let combined = Policy::all_of(vec![first, second]);
            assert_eq!(
                combined.org_groups(DEFAULT_MAX_ORG_GROUPS),
                Ok(vec![orgs(&["A", "C"]), orgs(&["B", "C"])])
            );
            assert_eq!(combined.organizations(), orgs(&["A", "B", "C"]));
        }
    }

    #[test]
    fn expansion_respects_group_cap() {
        let policy = Policy::parse(
            "AND(OR('A.member','B.member'), OR('C.member','D.member'), OR('E.member','F.member'))",
        );
        assert!(policy.is_ok());
        if let Ok(policy) = policy {
            assert_eq!(
                policy.org_groups(4),
                Err(PolicyError::TooManyGroups { limit: 4 })
            );
            assert!(matches!(policy.org_groups(8), Ok(groups) if groups.len() == 8));
        }
    }

    #[test]
    fn display_round_trips_through_parser() {
        let text = "OutOf(2, 'A.member', 'B.peer', AND('C.member', 'D.member'))";
        let policy = Policy::parse(text);
        assert!(policy.is_ok());
        if let Ok(policy) = policy {
            assert_eq!(Policy::parse(&policy.to_string()), Ok(policy));
        }
    }

    #[test]
    fn combinations_enumerates_lexicographically() {
        assert_eq!(
            combinations(4, 2),
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(combinations(2, 3), Vec::<Vec<usize>>::new());
        assert_eq!(combinations(3, 0), vec![Vec::<usize>::new()]);
    }
}
