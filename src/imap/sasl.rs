//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Oryx.
//
// Oryx is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Oryx is distributed  in the hope  that it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Oryx. If not, see <http://www.gnu.org/licenses/>.

//! SASL mechanisms shared by IMAP, POP3 and ManageSieve.
//!
//! The machine owns challenge generation and response parsing; the
//! caller owns the credential check, since that needs a database round
//! trip. SASL-IR (an initial response on the AUTHENTICATE line itself)
//! is accepted for every mechanism.

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    Anonymous,
    CramMd5,
}

impl Mechanism {
    pub fn by_name(name: &str) -> Option<Mechanism> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "LOGIN" => Some(Mechanism::Login),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            "CRAM-MD5" => Some(Mechanism::CramMd5),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::Anonymous => "ANONYMOUS",
            Mechanism::CramMd5 => "CRAM-MD5",
        }
    }
}

/// Every mechanism this build offers, for capability strings.
pub const MECHANISMS: &[Mechanism] = &[
    Mechanism::Plain,
    Mechanism::Login,
    Mechanism::Anonymous,
    Mechanism::CramMd5,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslState {
    AwaitingInitialResponse,
    IssuingChallenge,
    AwaitingResponse,
    Authenticating,
    Succeeded,
    Failed,
    Terminated,
}

/// How the caller should check the credentials the machine collected.
#[derive(Clone, Debug, PartialEq)]
pub enum Proof {
    /// Compare the secret directly.
    Plain { password: String },
    /// `hex(hmac_md5(secret, challenge))` must equal `digest`.
    CramMd5 { challenge: String, digest: String },
    /// No secret; trace information only.
    Anonymous { trace: String },
}

/// What the caller must do next.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Send this challenge (already base64-encoded) and wait for a
    /// response line.
    Challenge(String),
    /// Credentials collected; verify them against the user's secret.
    Verify { login: String, proof: Proof },
    /// The client aborted or sent garbage.
    Failed(&'static str),
}

pub struct SaslMachine {
    mechanism: Mechanism,
    state: SaslState,
    /// CRAM-MD5 challenge, kept for verification.
    challenge: Option<String>,
    /// LOGIN sends the name and secret in separate round trips.
    login_name: Option<String>,
}

impl SaslMachine {
    pub fn new(mechanism: Mechanism, hostname: &str) -> Self {
        let challenge = if Mechanism::CramMd5 == mechanism {
            let nonce: u64 = rand::thread_rng().gen();
            Some(format!(
                "<{}.{}@{}>",
                nonce,
                chrono::Utc::now().timestamp(),
                hostname,
            ))
        } else {
            None
        };

        SaslMachine {
            mechanism,
            state: SaslState::AwaitingInitialResponse,
            challenge,
            login_name: None,
        }
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Starts the exchange. `initial` is the SASL-IR payload, already
    /// base64-decoded, if the client sent one.
    pub fn start(&mut self, initial: Option<Vec<u8>>) -> Step {
        match initial {
            Some(payload) => self.respond(&payload),
            None => {
                self.state = SaslState::IssuingChallenge;
                let challenge = match self.mechanism {
                    Mechanism::CramMd5 => base64::encode(
                        self.challenge.as_deref().unwrap_or(""),
                    ),
                    Mechanism::Login => {
                        base64::encode("Username:")
                    },
                    // PLAIN and ANONYMOUS get an empty challenge.
                    _ => String::new(),
                };
                self.state = SaslState::AwaitingResponse;
                Step::Challenge(challenge)
            },
        }
    }

    /// Feeds one decoded client response into the machine.
    pub fn respond(&mut self, payload: &[u8]) -> Step {
        let step = match self.mechanism {
            Mechanism::Plain => self.respond_plain(payload),
            Mechanism::Login => self.respond_login(payload),
            Mechanism::Anonymous => self.respond_anonymous(payload),
            Mechanism::CramMd5 => self.respond_cram_md5(payload),
        };
        match step {
            Step::Verify { .. } => {
                self.state = SaslState::Authenticating
            },
            Step::Challenge(_) => {
                self.state = SaslState::AwaitingResponse
            },
            Step::Failed(_) => self.state = SaslState::Failed,
        }
        step
    }

    /// The client sent "*" to abort.
    pub fn terminate(&mut self) {
        self.state = SaslState::Terminated;
    }

    pub fn finish(&mut self, success: bool) {
        self.state = if success {
            SaslState::Succeeded
        } else {
            SaslState::Failed
        };
    }

    fn respond_plain(&mut self, payload: &[u8]) -> Step {
        // authzid NUL authcid NUL password
        let parts: Vec<&[u8]> = payload.splitn(3, |&b| 0 == b).collect();
        if 3 != parts.len() {
            return Step::Failed("malformed PLAIN response");
        }
        let authcid = String::from_utf8_lossy(parts[1]).into_owned();
        let password = String::from_utf8_lossy(parts[2]).into_owned();
        if authcid.is_empty() {
            return Step::Failed("empty authentication id");
        }
        Step::Verify {
            login: authcid,
            proof: Proof::Plain { password },
        }
    }

    fn respond_login(&mut self, payload: &[u8]) -> Step {
        match self.login_name.take() {
            None => {
                self.login_name = Some(
                    String::from_utf8_lossy(payload).into_owned(),
                );
                Step::Challenge(base64::encode("Password:"))
            },
            Some(login) => Step::Verify {
                login,
                proof: Proof::Plain {
                    password: String::from_utf8_lossy(payload)
                        .into_owned(),
                },
            },
        }
    }

    fn respond_anonymous(&mut self, payload: &[u8]) -> Step {
        Step::Verify {
            login: "anonymous".to_owned(),
            proof: Proof::Anonymous {
                trace: String::from_utf8_lossy(payload).into_owned(),
            },
        }
    }

    fn respond_cram_md5(&mut self, payload: &[u8]) -> Step {
        let text = String::from_utf8_lossy(payload);
        let mut parts = text.rsplitn(2, ' ');
        let digest = match parts.next() {
            Some(d) if !d.is_empty() => d.to_owned(),
            _ => return Step::Failed("malformed CRAM-MD5 response"),
        };
        let login = match parts.next() {
            Some(l) if !l.is_empty() => l.to_owned(),
            _ => return Step::Failed("malformed CRAM-MD5 response"),
        };
        Step::Verify {
            login,
            proof: Proof::CramMd5 {
                challenge: self
                    .challenge
                    .clone()
                    .unwrap_or_default(),
                digest,
            },
        }
    }
}

/// Checks a collected proof against the stored secret.
pub fn verify(proof: &Proof, secret: &str) -> bool {
    match *proof {
        Proof::Plain { ref password } => {
            !secret.is_empty() && password == secret
        },
        Proof::CramMd5 {
            ref challenge,
            ref digest,
        } => {
            hmac_md5_hex(secret.as_bytes(), challenge.as_bytes())
                .eq_ignore_ascii_case(digest)
        },
        Proof::Anonymous { .. } => true,
    }
}

fn hmac_md5_hex(key: &[u8], data: &[u8]) -> String {
    let pkey = openssl::pkey::PKey::hmac(key)
        .expect("HMAC key construction failed");
    let mut signer = openssl::sign::Signer::new(
        openssl::hash::MessageDigest::md5(),
        &pkey,
    )
    .expect("HMAC-MD5 unavailable");
    signer.update(data).expect("HMAC update failed");
    let digest = signer.sign_to_vec().expect("HMAC sign failed");
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_with_initial_response() {
        let mut machine = SaslMachine::new(Mechanism::Plain, "host");
        let step = machine.start(Some(b"\0alice\0pw".to_vec()));
        assert_eq!(
            Step::Verify {
                login: "alice".to_owned(),
                proof: Proof::Plain {
                    password: "pw".to_owned(),
                },
            },
            step,
        );
        assert_eq!(SaslState::Authenticating, machine.state());
        assert!(verify(
            &Proof::Plain {
                password: "pw".to_owned(),
            },
            "pw",
        ));
    }

    #[test]
    fn plain_without_initial_response_challenges_first() {
        let mut machine = SaslMachine::new(Mechanism::Plain, "host");
        assert_eq!(
            Step::Challenge(String::new()),
            machine.start(None),
        );
        let step = machine.respond(b"\0bob\0secret");
        assert_matches!(Step::Verify { .. }, step);
    }

    #[test]
    fn plain_rejects_garbage() {
        let mut machine = SaslMachine::new(Mechanism::Plain, "host");
        assert_matches!(
            Step::Failed(_),
            machine.start(Some(b"no separators".to_vec()))
        );
        assert_eq!(SaslState::Failed, machine.state());
    }

    #[test]
    fn login_two_round_trips() {
        let mut machine = SaslMachine::new(Mechanism::Login, "host");
        assert_eq!(
            Step::Challenge(base64::encode("Username:")),
            machine.start(None),
        );
        assert_eq!(
            Step::Challenge(base64::encode("Password:")),
            machine.respond(b"carol"),
        );
        assert_eq!(
            Step::Verify {
                login: "carol".to_owned(),
                proof: Proof::Plain {
                    password: "hunter2".to_owned(),
                },
            },
            machine.respond(b"hunter2"),
        );
    }

    #[test]
    fn cram_md5_round_trip() {
        let mut machine =
            SaslMachine::new(Mechanism::CramMd5, "example.org");
        let challenge = match machine.start(None) {
            Step::Challenge(c) => {
                String::from_utf8(base64::decode(&c).unwrap())
                    .unwrap()
            },
            other => panic!("unexpected step: {:?}", other),
        };
        assert!(challenge.starts_with('<'));
        assert!(challenge.ends_with("@example.org>"));

        let digest =
            hmac_md5_hex(b"tanstaaftanstaaf", challenge.as_bytes());
        let step = machine
            .respond(format!("tim {}", digest).as_bytes());
        match step {
            Step::Verify { login, proof } => {
                assert_eq!("tim", login);
                assert!(verify(&proof, "tanstaaftanstaaf"));
                assert!(!verify(&proof, "wrong"));
            },
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn rfc2195_worked_example() {
        // The HMAC-MD5 example from RFC 2195 §2.
        let digest = hmac_md5_hex(
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!("b913a602c7eda7a495b4e6e7334d3890", digest);
    }

    #[test]
    fn anonymous_accepts_any_trace() {
        let mut machine =
            SaslMachine::new(Mechanism::Anonymous, "host");
        let step = machine.start(Some(b"sirhc".to_vec()));
        assert_eq!(
            Step::Verify {
                login: "anonymous".to_owned(),
                proof: Proof::Anonymous {
                    trace: "sirhc".to_owned(),
                },
            },
            step,
        );
    }
}
