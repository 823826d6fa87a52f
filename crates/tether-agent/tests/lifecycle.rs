//! Agent lifecycle against a scripted in-memory server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_agent::{Agent, AgentConfig, AgentState, NoopHooks, ProvisionStore};
use tether_auth::{Algorithm, AuthKeys, SecretTable};
use tether_protocol::{
    ClientId, Codec, ConfigResponse, ErrorCode, Frame, JsonCodec, ReportResponse,
    SignInResponse, SignOutResponse, SignUpRequest, SignUpResponse,
};
use tether_store::MemoryStore;
use tether_transport::{Connection, MemoryConnection, MemoryDialer, MemoryTransport, Transport};

// =========================================================================
// Scripted server
// =========================================================================

const IDENTITY: &str = "0123456789abcdef0123456789abcdef";
const EXPIRY: u64 = u64::MAX / 2;

fn secrets() -> SecretTable {
    SecretTable::new().with_secret(Algorithm::Aes, *b"0123456789abcdef")
}

#[derive(Clone, Copy)]
enum Script {
    /// Answers everything correctly.
    Cooperative,
    /// Answers SignUp with a response derived from the wrong expiry.
    ForgedResponse,
    /// Knows no identity at SignIn.
    Forgetful,
}

#[derive(Default)]
struct Calls(Mutex<HashMap<String, usize>>);

impl Calls {
    fn count(&self, procedure: &str) -> usize {
        self.0.lock().get(procedure).copied().unwrap_or_default()
    }
}

fn answer(script: Script, procedure: &str, payload: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let codec = JsonCodec;
    let keys = AuthKeys::new(secrets());
    match (procedure, script) {
        ("SignUp", Script::Forgetful) | ("SignUp", Script::Cooperative) => {
            let request: SignUpRequest = codec.decode(payload).unwrap();
            let response = keys
                .response(
                    request.algorithm,
                    IDENTITY,
                    request.device_id.as_str(),
                    request.timestamp,
                    EXPIRY,
                )
                .unwrap();
            Ok(codec
                .encode(&SignUpResponse {
                    identity: ClientId::new(IDENTITY),
                    expire_time: EXPIRY,
                    response,
                })
                .unwrap())
        }
        ("SignUp", Script::ForgedResponse) => {
            let request: SignUpRequest = codec.decode(payload).unwrap();
            let response = keys
                .response(
                    request.algorithm,
                    IDENTITY,
                    request.device_id.as_str(),
                    request.timestamp,
                    EXPIRY - 1,
                )
                .unwrap();
            Ok(codec
                .encode(&SignUpResponse {
                    identity: ClientId::new(IDENTITY),
                    expire_time: EXPIRY,
                    response,
                })
                .unwrap())
        }
        ("SignIn", Script::Forgetful) => Err(ErrorCode::NotFound),
        ("SignIn", _) => Ok(codec
            .encode(&SignInResponse {
                identity: ClientId::new(IDENTITY),
                expire_time: EXPIRY,
                server_time: 1,
            })
            .unwrap()),
        ("SignOut", _) => Ok(codec.encode(&SignOutResponse {}).unwrap()),
        ("Report", _) => Ok(codec.encode(&ReportResponse { server_time: 1 }).unwrap()),
        ("Config", _) => Ok(codec
            .encode(&ConfigResponse {
                version: 1,
                settings: Default::default(),
            })
            .unwrap()),
        _ => Err(ErrorCode::NotFound),
    }
}

async fn serve(conn: MemoryConnection, script: Script, calls: Arc<Calls>) {
    let codec = JsonCodec;
    while let Ok(Some(bytes)) = conn.recv().await {
        let frame: Frame = codec.decode(&bytes).unwrap();
        let Frame::Request {
            id,
            procedure,
            payload,
            ..
        } = frame
        else {
            continue;
        };
        *calls.0.lock().entry(procedure.clone()).or_default() += 1;
        let reply = match answer(script, &procedure, &payload) {
            Ok(payload) => Frame::ok(id, payload),
            Err(code) => Frame::error(id, code, "scripted failure"),
        };
        if conn.send(&codec.encode(&reply).unwrap()).await.is_err() {
            break;
        }
    }
}

fn start_server(script: Script) -> (MemoryDialer, Arc<Calls>) {
    let (mut transport, dialer) = MemoryTransport::new();
    let calls = Arc::new(Calls::default());
    let counted = Arc::clone(&calls);
    tokio::spawn(async move {
        while let Ok(conn) = transport.accept().await {
            tokio::spawn(serve(conn, script, Arc::clone(&counted)));
        }
    });
    (dialer, calls)
}

fn config() -> AgentConfig {
    AgentConfig {
        tick_period_ms: 100,
        report_every_ticks: 2,
        ..AgentConfig::new("dev-1")
    }
}

async fn agent(
    dialer: MemoryDialer,
    store: Arc<MemoryStore>,
) -> Agent<MemoryDialer, MemoryStore> {
    Agent::new(config(), dialer, store, secrets(), NoopHooks)
        .await
        .unwrap()
}

async fn run_for(duration: Duration) {
    tokio::time::sleep(duration).await;
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_cooperative_server_leads_to_servicing_and_reports() {
    let (dialer, calls) = start_server(Script::Cooperative);
    let agent = agent(dialer, Arc::new(MemoryStore::new())).await;

    agent.start().unwrap();
    run_for(Duration::from_secs(2)).await;

    assert_eq!(agent.state(), Some(AgentState::Servicing));
    assert_eq!(agent.identity(), ClientId::new(IDENTITY));
    assert_eq!(calls.count("SignUp"), 1);
    assert_eq!(calls.count("SignIn"), 1);
    assert_eq!(calls.count("Config"), 1);
    assert!(calls.count("Report") >= 2);

    agent.stop().await.unwrap();
    assert_eq!(calls.count("SignOut"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_forged_sign_up_response_keeps_agent_authenticating() {
    let (dialer, calls) = start_server(Script::ForgedResponse);
    let agent = agent(dialer, Arc::new(MemoryStore::new())).await;

    agent.start().unwrap();
    run_for(Duration::from_secs(1)).await;

    assert_eq!(agent.state(), Some(AgentState::Authenticating));
    assert!(agent.identity().is_empty());
    assert!(calls.count("SignUp") >= 2, "retried on later ticks");
    assert_eq!(calls.count("SignIn"), 0);

    agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_not_found_resets_provisioning() {
    let (dialer, calls) = start_server(Script::Forgetful);
    let store = Arc::new(MemoryStore::new());
    ProvisionStore::open(Arc::clone(&store))
        .await
        .unwrap()
        .update_identity(ClientId::new("stale"), EXPIRY)
        .await
        .unwrap();
    let agent = agent(dialer, store).await;

    agent.start().unwrap();
    run_for(Duration::from_secs(1)).await;

    // The stored identity never needed a SignUp; only the reset after the
    // first NotFound can have triggered one.
    assert!(calls.count("SignIn") >= 2);
    assert!(calls.count("SignUp") >= 1);
    assert_eq!(agent.state(), Some(AgentState::Authenticating));

    agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start_is_harmless() {
    let (dialer, calls) = start_server(Script::Cooperative);
    let agent = agent(dialer, Arc::new(MemoryStore::new())).await;

    agent.stop().await.unwrap();

    assert_eq!(calls.count("SignOut"), 0);
}
