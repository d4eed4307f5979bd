/// A write command whose reply is always an integer (count or new length).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LPush { key: String, value: String },
    RPush { key: String, value: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    Del { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::LPush { key, .. }
            | Command::RPush { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::HSet { key, .. }
            | Command::HDel { key, .. }
            | Command::Del { key } => key,
        }
    }

    /// Redis command name
    pub fn name(&self) -> &'static str {
        match self {
            Command::LPush { .. } => "LPUSH",
            Command::RPush { .. } => "RPUSH",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::HSet { .. } => "HSET",
            Command::HDel { .. } => "HDEL",
            Command::Del { .. } => "DEL",
        }
    }

    /// Arguments following the key, in wire order.
    pub fn args(&self) -> Vec<String> {
        match self {
            Command::LPush { value, .. } | Command::RPush { value, .. } => vec![value.clone()],
            Command::ZAdd { score, member, .. } => vec![score.to_string(), member.clone()],
            Command::ZRem { member, .. } => vec![member.clone()],
            Command::HSet { field, value, .. } => vec![field.clone(), value.clone()],
            Command::HDel { field, .. } => vec![field.clone()],
            Command::Del { .. } => Vec::new(),
        }
    }
}

/// Commands executed all-or-nothing, MULTI/EXEC style.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn lpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Command::LPush {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn rpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Command::RPush {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn zadd(&mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> &mut Self {
        self.push(Command::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::ZRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Del { key: key.into() })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl From<Command> for Batch {
    fn from(command: Command) -> Self {
        Self {
            commands: vec![command],
        }
    }
}
