//! Server side of OPAQUE registration and login.
//!
//! Stateless functions: the caller persists the password file and the
//! ephemeral login state.

use opaque_ke::{
    CredentialFinalization, CredentialRequest, RegistrationRequest, RegistrationUpload,
    ServerLogin, ServerLoginStartParameters, ServerRegistration,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use vault_core::Identity;

use super::{identifiers, ServerSetup, SessionKey, VaultCipherSuite};
use crate::error::CryptoError;

pub struct ServerLoginStart {
    /// CredentialResponse for the client
    pub response: Vec<u8>,
    /// Ephemeral state to persist until login finish
    pub server_state: Vec<u8>,
}

/// SHA-256 of a stored password file. Lets the server tell whether a
/// registration changed between login start and finish.
pub fn password_file_fingerprint(password_file: &[u8]) -> Vec<u8> {
    Sha256::digest(password_file).to_vec()
}

/// Evaluate the OPRF on a registration request. Persists nothing.
pub fn create_registration_response(
    setup: &ServerSetup,
    identity: &Identity,
    request: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let request = RegistrationRequest::<VaultCipherSuite>::deserialize(request)?;
    let result =
        ServerRegistration::<VaultCipherSuite>::start(setup.inner(), request, identity.as_bytes())?;
    Ok(result.message.serialize().to_vec())
}

/// Turn the client's upload into the password file to store.
pub fn finish_registration(upload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let upload = RegistrationUpload::<VaultCipherSuite>::deserialize(upload)?;
    let password_file = ServerRegistration::<VaultCipherSuite>::finish(upload);
    Ok(password_file.serialize().to_vec())
}

/// Answer a credential request.
///
/// With `password_file == None` (unknown identity) OPAQUE produces a dummy
/// response indistinguishable from a real one; the login then fails at
/// finish exactly like a wrong password.
pub fn start_login(
    setup: &ServerSetup,
    identity: &Identity,
    password_file: Option<&[u8]>,
    request: &[u8],
) -> Result<ServerLoginStart, CryptoError> {
    let request = CredentialRequest::<VaultCipherSuite>::deserialize(request)?;
    let password_file = password_file
        .map(ServerRegistration::<VaultCipherSuite>::deserialize)
        .transpose()?;

    let params = ServerLoginStartParameters {
        context: None,
        identifiers: identifiers(identity),
    };
    let result = ServerLogin::start(
        &mut OsRng,
        setup.inner(),
        password_file,
        request,
        identity.as_bytes(),
        params,
    )?;

    Ok(ServerLoginStart {
        response: result.message.serialize().to_vec(),
        server_state: result.state.serialize().to_vec(),
    })
}

/// Verify the client's finalization against the ephemeral state.
pub fn finish_login(server_state: &[u8], finish_request: &[u8]) -> Result<SessionKey, CryptoError> {
    let state = ServerLogin::<VaultCipherSuite>::deserialize(server_state)?;
    let finalization = CredentialFinalization::<VaultCipherSuite>::deserialize(finish_request)
        .map_err(|_| CryptoError::Authentication)?;
    let result = state
        .finish(finalization)
        .map_err(|_| CryptoError::Authentication)?;
    Ok(SessionKey::from_bytes(&result.session_key))
}
