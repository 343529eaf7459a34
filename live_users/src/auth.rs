use crate::{
    directory::{blocking, UserDirectory},
    error::AuthError,
    model::Account,
};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use std::sync::Arc;

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| AuthError::Hash(e.to_string()))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Look up `login_id` and check `password`. Unknown logins and wrong
/// passwords are indistinguishable to the caller.
pub async fn authenticate(
    directory: &Arc<dyn UserDirectory>,
    login_id: &str,
    password: &str,
) -> Result<Account, AuthError> {
    let login_id = login_id.to_string();
    let password = password.to_string();
    let found = blocking(directory, move |d| {
        let account = d.find_by_login(&login_id)?;
        Ok(account.filter(|a| verify_password(&password, &a.password_hash)))
    })
    .await?;
    found.ok_or(AuthError::InvalidCredentials)
}

/// Hash on the blocking pool; argon2 is deliberately slow.
pub async fn hash_password_blocking(pass: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_password(&pass))
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))?
}
