//! Client side of OPAQUE registration and login.

use opaque_ke::{
    ClientLogin, ClientLoginFinishParameters, ClientRegistration,
    ClientRegistrationFinishParameters, CredentialResponse, RegistrationResponse,
};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use vault_core::{Identity, KsfParams};

use super::{identifiers, SessionKey, VaultCipherSuite};
use crate::error::CryptoError;
use crate::kdf::{build_ksf, ExportKey};

/// Client state held between registration start and finish.
pub struct ClientRegistrationState(ClientRegistration<VaultCipherSuite>);

/// Client state held between login start and finish.
pub struct ClientLoginState(ClientLogin<VaultCipherSuite>);

pub struct RegistrationFinish {
    /// RegistrationUpload for the server
    pub upload: Vec<u8>,
    pub export_key: ExportKey,
}

pub struct LoginFinish {
    /// CredentialFinalization for the server
    pub finish_request: Vec<u8>,
    pub export_key: ExportKey,
    pub session_key: SessionKey,
}

/// Blind the password and produce a RegistrationRequest.
pub fn start_registration(
    password: &SecretString,
) -> Result<(ClientRegistrationState, Vec<u8>), CryptoError> {
    let result = ClientRegistration::<VaultCipherSuite>::start(
        &mut OsRng,
        password.expose_secret().as_bytes(),
    )?;
    Ok((
        ClientRegistrationState(result.state),
        result.message.serialize().to_vec(),
    ))
}

/// Finish registration with the server's response, stretching the OPRF
/// output with Argon2id using `ksf`.
pub fn finish_registration(
    state: ClientRegistrationState,
    password: &SecretString,
    response: &[u8],
    identity: &Identity,
    ksf: &KsfParams,
) -> Result<RegistrationFinish, CryptoError> {
    let response = RegistrationResponse::<VaultCipherSuite>::deserialize(response)?;
    let argon2 = build_ksf(ksf)?;
    let params = ClientRegistrationFinishParameters::new(identifiers(identity), Some(&argon2));

    let result = state.0.finish(
        &mut OsRng,
        password.expose_secret().as_bytes(),
        response,
        params,
    )?;

    Ok(RegistrationFinish {
        upload: result.message.serialize().to_vec(),
        export_key: ExportKey::from_bytes(&result.export_key),
    })
}

pub fn start_login(password: &SecretString) -> Result<(ClientLoginState, Vec<u8>), CryptoError> {
    let result =
        ClientLogin::<VaultCipherSuite>::start(&mut OsRng, password.expose_secret().as_bytes())?;
    Ok((
        ClientLoginState(result.state),
        result.message.serialize().to_vec(),
    ))
}

/// Finish login. A wrong password fails here, locally, as
/// [`CryptoError::Authentication`]; nothing explaining why is sent anywhere.
pub fn finish_login(
    state: ClientLoginState,
    password: &SecretString,
    response: &[u8],
    identity: &Identity,
    ksf: &KsfParams,
) -> Result<LoginFinish, CryptoError> {
    let response = CredentialResponse::<VaultCipherSuite>::deserialize(response)
        .map_err(|_| CryptoError::Authentication)?;
    let argon2 = build_ksf(ksf)?;
    let params = ClientLoginFinishParameters {
        context: None,
        identifiers: identifiers(identity),
        ksf: Some(&argon2),
    };

    let result = state
        .0
        .finish(password.expose_secret().as_bytes(), response, params)
        .map_err(|_| CryptoError::Authentication)?;

    Ok(LoginFinish {
        finish_request: result.message.serialize().to_vec(),
        export_key: ExportKey::from_bytes(&result.export_key),
        session_key: SessionKey::from_bytes(&result.session_key),
    })
}
