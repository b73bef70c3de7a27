use rand::rngs::OsRng;
use rand::Rng;

use crate::errors::AppError;
use crate::store::TokenStore;
use crate::vault::crypto::hash_token;

/// Characters a generated token is drawn from.
pub const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A plaintext token together with its lookup digest, known to be free in
/// the store at the time of the check.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub plaintext: String,
    pub hashed_value: String,
}

#[derive(Debug, Clone)]
pub struct TokenGenerator {
    length: usize,
    max_attempts: u32,
}

impl TokenGenerator {
    pub fn new(length: usize, max_attempts: u32) -> Self {
        Self {
            length,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Draws one candidate from the OS CSPRNG, one character at a time.
    pub fn draw(&self) -> String {
        let mut rng = OsRng;
        (0..self.length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// Draws until a value whose hash is not stored yet comes up. `spent`
    /// counts draws across calls, so a caller that loses the insert race
    /// redraws within the same `max_attempts` budget.
    pub async fn generate(
        &self,
        store: &dyn TokenStore,
        spent: &mut u32,
    ) -> Result<Candidate, AppError> {
        while *spent < self.max_attempts {
            *spent += 1;
            let attempt = *spent;
            let plaintext = self.draw();
            let hashed_value = hash_token(&plaintext);
            if store.find_by_hash(&hashed_value).await?.is_none() {
                return Ok(Candidate {
                    plaintext,
                    hashed_value,
                });
            }
            tracing::warn!(attempt, "generated token collides with a stored one, redrawing");
        }

        Err(AppError::GenerationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Uniqueness check for a caller-chosen value. A taken value is an error,
    /// never silently replaced.
    pub async fn claim_custom(
        &self,
        plaintext: &str,
        store: &dyn TokenStore,
    ) -> Result<Candidate, AppError> {
        let hashed_value = hash_token(plaintext);
        if store.find_by_hash(&hashed_value).await?.is_some() {
            return Err(AppError::DuplicateToken);
        }
        Ok(Candidate {
            plaintext: plaintext.to_owned(),
            hashed_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::{NewToken, TokenRecord};
    use crate::store::memory::MemoryStore;
    use crate::store::{StoreError, TokenTx};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    /// Reports every hash as taken.
    struct Saturated;

    #[async_trait]
    impl TokenStore for Saturated {
        async fn find_by_hash(&self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError> {
            Ok(Some(TokenRecord {
                id: Uuid::new_v4(),
                hashed_value: hashed_value.into(),
                encrypted_value: vec![],
                encryption_nonce: vec![],
                owner_label: "someone".into(),
                bound_device_id: None,
                last_used_at: None,
                expires_at: None,
                created_at: Utc::now(),
            }))
        }
        async fn find_by_id(&self, _: Uuid) -> Result<Option<TokenRecord>, StoreError> {
            unreachable!()
        }
        async fn list_by_owner(&self, _: &str) -> Result<Vec<TokenRecord>, StoreError> {
            unreachable!()
        }
        async fn insert(&self, _: &NewToken) -> Result<Uuid, StoreError> {
            unreachable!()
        }
        async fn begin(&self) -> Result<Box<dyn TokenTx>, StoreError> {
            unreachable!()
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_draw_uses_alphabet_and_length() {
        let generator = TokenGenerator::new(12, 8);
        for _ in 0..200 {
            let token = generator.draw();
            assert_eq!(token.len(), 12);
            assert!(token.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_draws_differ() {
        let generator = TokenGenerator::new(16, 8);
        assert_ne!(generator.draw(), generator.draw());
    }

    #[tokio::test]
    async fn test_generate_returns_matching_hash() {
        let store = MemoryStore::new();
        let candidate = TokenGenerator::new(12, 8).generate(&store, &mut 0).await.unwrap();
        assert_eq!(candidate.hashed_value, hash_token(&candidate.plaintext));
    }

    #[tokio::test]
    async fn test_generate_gives_up_after_max_attempts() {
        let mut spent = 0;
        let err = TokenGenerator::new(12, 3)
            .generate(&Saturated, &mut spent)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GenerationExhausted { attempts: 3 }));
        assert_eq!(spent, 3);

        // A spent budget is not renewed by calling again.
        let store = MemoryStore::new();
        let err = TokenGenerator::new(12, 3)
            .generate(&store, &mut spent)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GenerationExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_claim_custom_rejects_taken_value() {
        let err = TokenGenerator::new(12, 3)
            .claim_custom("MYTOKEN1", &Saturated)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateToken));

        let store = MemoryStore::new();
        let ok = TokenGenerator::new(12, 3)
            .claim_custom("MYTOKEN1", &store)
            .await
            .unwrap();
        assert_eq!(ok.plaintext, "MYTOKEN1");
    }
}
