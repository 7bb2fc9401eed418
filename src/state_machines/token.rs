use crate::state_machines::command::TokenType;
use crate::state_machines::state_machine::{ApplyError, ReplicatedStateMachine};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct TokenRequest {
    pub token_type: TokenType,
    pub name: String,
}

/// Maps token names (labels, property keys, relationship types) to cluster-wide ids. Ids are
/// handed out densely per token type, in commit order.
#[derive(Clone)]
pub struct ReplicatedTokenStateMachine {
    logger: slog::Logger,
    registries: HashMap<TokenType, TokenRegistry>,
    last_applied_index: u64,
}

#[derive(Clone, Default)]
struct TokenRegistry {
    ids_by_name: HashMap<String, u64>,
    names_by_id: Vec<String>,
}

impl ReplicatedTokenStateMachine {
    pub fn new(logger: slog::Logger) -> Self {
        ReplicatedTokenStateMachine {
            logger,
            registries: HashMap::new(),
            last_applied_index: 0,
        }
    }

    /// Rebuilds the machine from names per type, ordered by id, as of `last_applied_index`.
    pub(super) fn restore(logger: slog::Logger, last_applied_index: u64, tokens: &[(TokenType, Vec<String>)]) -> Self {
        let registries = tokens
            .iter()
            .map(|(token_type, names)| {
                let ids_by_name = names
                    .iter()
                    .enumerate()
                    .map(|(id, name)| (name.clone(), id as u64))
                    .collect();
                let registry = TokenRegistry {
                    ids_by_name,
                    names_by_id: names.clone(),
                };
                (*token_type, registry)
            })
            .collect();

        ReplicatedTokenStateMachine {
            logger,
            registries,
            last_applied_index,
        }
    }

    /// Names per type, ordered by id. Types are in a fixed order so every member exports the same.
    pub(super) fn export(&self) -> Vec<(TokenType, Vec<String>)> {
        let mut tokens: Vec<(TokenType, Vec<String>)> = self
            .registries
            .iter()
            .map(|(token_type, registry)| (*token_type, registry.names_by_id.clone()))
            .collect();
        tokens.sort_by_key(|(token_type, _)| *token_type);
        tokens
    }

    pub fn token_id(&self, token_type: TokenType, name: &str) -> Option<u64> {
        self.registries
            .get(&token_type)
            .and_then(|registry| registry.ids_by_name.get(name))
            .copied()
    }

    pub fn token_name(&self, token_type: TokenType, id: u64) -> Option<&str> {
        self.registries
            .get(&token_type)
            .and_then(|registry| registry.names_by_id.get(id as usize))
            .map(String::as_str)
    }

    /// All tokens of a type, ordered by id.
    pub fn tokens(&self, token_type: TokenType) -> Vec<(u64, String)> {
        match self.registries.get(&token_type) {
            None => vec![],
            Some(registry) => registry
                .names_by_id
                .iter()
                .enumerate()
                .map(|(id, name)| (id as u64, name.clone()))
                .collect(),
        }
    }
}

impl ReplicatedStateMachine for ReplicatedTokenStateMachine {
    type Command = TokenRequest;

    fn apply(&mut self, index: u64, request: TokenRequest) -> Result<(), ApplyError> {
        if index <= self.last_applied_index {
            slog::debug!(self.logger, "Ignoring token request at already applied index {}", index);
            return Ok(());
        }

        let registry = self.registries.entry(request.token_type).or_default();
        if !registry.ids_by_name.contains_key(&request.name) {
            let id = registry.names_by_id.len() as u64;
            slog::info!(
                self.logger,
                "Token {:?} '{}' assigned id {}",
                request.token_type,
                request.name,
                id
            );
            registry.ids_by_name.insert(request.name.clone(), id);
            registry.names_by_id.push(request.name);
        }

        self.last_applied_index = index;
        Ok(())
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(token_type: TokenType, name: &str) -> TokenRequest {
        TokenRequest {
            token_type,
            name: name.to_string(),
        }
    }

    #[test]
    fn ids_are_assigned_per_type_and_reused_for_known_names() {
        // -- setup --
        let mut tokens = ReplicatedTokenStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()));

        // -- execute --
        tokens.apply(1, request(TokenType::Label, "Person")).unwrap();
        tokens.apply(2, request(TokenType::Label, "City")).unwrap();
        tokens.apply(3, request(TokenType::PropertyKey, "name")).unwrap();
        tokens.apply(4, request(TokenType::Label, "Person")).unwrap();

        // -- verify --
        assert_eq!(tokens.token_id(TokenType::Label, "Person"), Some(0));
        assert_eq!(tokens.token_id(TokenType::Label, "City"), Some(1));
        assert_eq!(tokens.token_id(TokenType::PropertyKey, "name"), Some(0));
        assert_eq!(tokens.token_id(TokenType::RelationshipType, "KNOWS"), None);
        assert_eq!(tokens.token_name(TokenType::Label, 1), Some("City"));
        assert_eq!(tokens.tokens(TokenType::Label).len(), 2);
        assert_eq!(tokens.last_applied_index(), 4);
    }

    #[test]
    fn replayed_indexes_are_ignored() {
        // -- setup --
        let mut tokens = ReplicatedTokenStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()));
        tokens.apply(5, request(TokenType::Label, "Person")).unwrap();

        // -- execute --
        tokens.apply(5, request(TokenType::Label, "Ghost")).unwrap();
        tokens.apply(3, request(TokenType::Label, "Ghost")).unwrap();

        // -- verify --
        assert_eq!(tokens.token_id(TokenType::Label, "Ghost"), None);
        assert_eq!(tokens.last_applied_index(), 5);
    }

    #[test]
    fn restored_machine_continues_where_the_export_left_off() {
        // -- setup --
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut tokens = ReplicatedTokenStateMachine::new(logger.clone());
        tokens.apply(1, request(TokenType::Label, "Person")).unwrap();
        tokens.apply(2, request(TokenType::Label, "City")).unwrap();

        // -- execute --
        let mut restored = ReplicatedTokenStateMachine::restore(logger, 2, &tokens.export());
        restored.apply(2, request(TokenType::Label, "Ghost")).unwrap();
        restored.apply(3, request(TokenType::Label, "Movie")).unwrap();

        // -- verify --
        assert_eq!(restored.token_id(TokenType::Label, "City"), Some(1));
        assert_eq!(restored.token_id(TokenType::Label, "Ghost"), None);
        assert_eq!(restored.token_id(TokenType::Label, "Movie"), Some(2));
        assert_eq!(restored.last_applied_index(), 3);
    }
}
