use std::fmt;

/// Generational index into a [`Registry`]. A token outlives its slot safely:
/// once the slot is reused the old token no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Token {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Token { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        Token { index, generation: 0 }
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        self.slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, token: Token) -> bool {
        self.get(token).is_some()
    }

    pub fn remove(&mut self, token: Token) -> Option<T> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.iter().map(|(token, _)| token).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (Token { index: index as u32, generation: slot.generation }, value)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut reg = Registry::new();
        let a = reg.insert("a");
        let b = reg.insert("b");

        assert_eq!(reg.get(a), Some(&"a"));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.remove(a), Some("a"));
        assert_eq!(reg.remove(a), None, "Second removal must not succeed");
        assert_eq!(reg.get(b), Some(&"b"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_stale_token_after_reuse() {
        let mut reg = Registry::new();
        let old = reg.insert(1);
        reg.remove(old);
        let new = reg.insert(2);

        assert_ne!(old, new);
        assert!(reg.get(old).is_none(), "Stale token must not see the reused slot");
        assert!(!reg.contains(old));
        assert_eq!(reg.get(new), Some(&2));
    }

    #[test]
    fn test_iter_skips_empty_slots() {
        let mut reg = Registry::new();
        let a = reg.insert("a");
        let b = reg.insert("b");
        let c = reg.insert("c");
        reg.remove(b);

        let tokens = reg.tokens();
        assert_eq!(tokens, vec![a, c]);
    }
}
