use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));
static MOBILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{7,15}$").expect("mobile regex"));
static LOGIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").expect("login regex"));

const MIN_PASSWORD_LEN: usize = 6;

/// Registration form. Missing fields deserialize empty so validation can
/// name them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterReq {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mobile_no: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub pincode: String,
    pub login_id: String,
    pub password: String,
}

/// Check a registration form, collecting one message per bad field.
pub fn validate_registration(req: &RegisterReq) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let required = [
        ("First name", &req.first_name),
        ("Last name", &req.last_name),
        ("Email", &req.email),
        ("Mobile number", &req.mobile_no),
        ("Street", &req.street),
        ("City", &req.city),
        ("State", &req.state),
        ("Country", &req.country),
        ("Pincode", &req.pincode),
        ("Login ID", &req.login_id),
        ("Password", &req.password),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            errors.push(format!("{name} is required"));
        }
    }
    if !req.email.trim().is_empty() && !EMAIL_RE.is_match(req.email.trim()) {
        errors.push("Email is invalid".into());
    }
    if !req.mobile_no.trim().is_empty() && !MOBILE_RE.is_match(req.mobile_no.trim()) {
        errors.push("Mobile number is invalid".into());
    }
    if !req.login_id.trim().is_empty() && !LOGIN_RE.is_match(req.login_id.trim()) {
        errors.push(
            "Login ID may only contain letters, digits, '.', '_' and '-' (3-32 chars)".into(),
        );
    }
    if !req.password.is_empty() && req.password.len() < MIN_PASSWORD_LEN {
        errors.push(format!("Password must be at least {MIN_PASSWORD_LEN} characters"));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
