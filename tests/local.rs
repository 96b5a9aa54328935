//! Local model server calls: endpoint choice, strategy fallback, cancellation
//! and discovery, end-to-end through `AiClient`.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{MockServer, NO_TAGS, Reply};
use mindwire::client::AiClient;
use mindwire::config::{FALLBACK_LOCAL_MODEL, Provider, ServiceConfig};
use mindwire::dispatch::retry::RecordingSleeper;
use mindwire::dispatch::{AiRequestParams, Message, Usage};
use mindwire::error::{AiClientError, ErrorKind};

fn local_client(server: &MockServer) -> (AiClient, Arc<RecordingSleeper>) {
    let mut config = ServiceConfig::default();
    config.local_model_url = server.url.clone();
    let sleeper = Arc::new(RecordingSleeper::new());
    let client = AiClient::with_sleeper(config, sleeper.clone()).unwrap();
    (client, sleeper)
}

fn ask(model: &str, messages: Vec<Message>) -> AiRequestParams {
    AiRequestParams::new(Provider::Ollama, model, messages)
}

#[tokio::test]
async fn generate_reply_with_eval_counts() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        "/api/generate" => Reply::ok(
            r#"{"model":"starcoder2","response":"fn main() {}","done":true,"prompt_eval_count":5,"eval_count":3}"#,
        ),
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let (client, sleeper) = local_client(&server);

    let mut params = ask("starcoder2", vec![Message::user("write main")]);
    params.stream = true;
    params.max_tokens = Some(32);
    let response = client.send_request(params).await.unwrap();

    assert_eq!(response.text, "fn main() {}");
    assert_eq!(response.usage, Some(Usage::new(5, 3)));
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(8));
    assert!(sleeper.recorded().is_empty());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let body = requests[0].json();
    assert_eq!(body["stream"], false);
    assert_eq!(body["prompt"], "User: write main\n\nAssistant:");
    assert_eq!(body["options"]["num_predict"], 32);
}

#[tokio::test]
async fn chat_preferred_for_system_prompt() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        "/api/chat" => Reply::ok(
            r#"{"message":{"role":"assistant","content":"Paris"},"done":true,"prompt_eval_count":20,"eval_count":2}"#,
        ),
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let (client, _) = local_client(&server);

    let response = client
        .send_request(ask(
            "starcoder2",
            vec![Message::system("answer in one word"), Message::user("capital of France?")],
        ))
        .await
        .unwrap();

    assert_eq!(response.text, "Paris");
    assert_eq!(response.usage, Some(Usage::new(20, 2)));
    let body = server.requests()[0].json();
    assert_eq!(body["messages"][0]["role"], "system");
}

#[tokio::test]
async fn array_of_fragments_is_concatenated() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::ok(
            r#"[{"response":"Hel","prompt_eval_count":4},{"response":"lo","eval_count":2},{"done":true}]"#,
        ),
    })
    .await;
    let (client, _) = local_client(&server);

    let response = client
        .send_request(ask("starcoder2", vec![Message::user("greet")]))
        .await
        .unwrap();
    assert_eq!(response.text, "Hello");
    assert_eq!(response.usage, Some(Usage::new(4, 2)));
}

#[tokio::test]
async fn ndjson_body_is_concatenated() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::ok("{\"response\":\"Hel\"}\n{\"response\":\"lo\"}\n{\"done\":true}\n"),
    })
    .await;
    let (client, _) = local_client(&server);

    let response = client
        .send_request(ask("starcoder2", vec![Message::user("greet")]))
        .await
        .unwrap();
    assert_eq!(response.text, "Hello");
}

#[tokio::test]
async fn chat_failure_falls_back_to_generate() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        "/api/chat" => Reply::status(500, r#"{"error":"chat template missing"}"#),
        "/api/generate" => Reply::ok(r#"{"response":"recovered"}"#),
        _ => Reply::status(404, "unexpected"),
    })
    .await;
    let (client, sleeper) = local_client(&server);

    // llama3 prefers the chat endpoint.
    let response = client
        .send_request(ask("llama3", vec![Message::user("hi")]))
        .await
        .unwrap();

    assert_eq!(response.text, "recovered");
    assert_eq!(server.hits("/api/chat"), 3);
    assert_eq!(server.hits("/api/generate"), 1);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_millis(800), Duration::from_millis(1600)]
    );

    let generate = server
        .requests()
        .into_iter()
        .find(|r| r.path == "/api/generate")
        .unwrap();
    let prompt = generate.json()["prompt"].as_str().unwrap().to_string();
    assert!(prompt.starts_with("<|begin_of_text|>"), "{prompt}");
    assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"), "{prompt}");
}

#[tokio::test]
async fn transient_failure_recovers_within_strategy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = MockServer::start(move |req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        "/api/generate" => {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::status(503, "loading model")
            } else {
                Reply::ok(r#"{"response":"second time lucky"}"#)
            }
        }
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let (client, sleeper) = local_client(&server);

    let response = client
        .send_request(ask("starcoder2", vec![Message::user("go")]))
        .await
        .unwrap();
    assert_eq!(response.text, "second time lucky");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(800)]);
}

#[tokio::test]
async fn every_strategy_failing_yields_aggregate() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::status(500, "model crashed"),
    })
    .await;
    let (client, sleeper) = local_client(&server);

    let err = client
        .send_request(ask("llama3", vec![Message::user("hi")]))
        .await
        .unwrap_err();

    let AiClientError::RetriesExhausted { attempts } = &err else {
        panic!("expected aggregate, got {err:?}");
    };
    assert_eq!(attempts.len(), 9);
    let names: Vec<&str> = attempts.iter().map(|a| a.strategy.as_str()).collect();
    assert_eq!(&names[..3], &["chat-api"; 3]);
    assert_eq!(&names[3..6], &["generate-api"; 3]);
    assert_eq!(&names[6..], &["generic"; 3]);
    assert_eq!(
        attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 1, 2, 3, 1, 2, 3]
    );
    assert!(attempts.iter().all(|a| a.message.contains("500")));
    assert_eq!(err.kind(), ErrorKind::Transport);

    assert_eq!(server.hits("/api/chat"), 3);
    // generate-api strategy plus the direct generic fallback
    assert_eq!(server.hits("/api/generate"), 6);
    assert_eq!(sleeper.recorded().len(), 6);
    assert!(client.in_flight().is_empty());
}

#[tokio::test]
async fn missing_local_model_carries_pull_hint() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::status(404, r#"{"error":"model 'nope' not found"}"#),
    })
    .await;
    let (client, _) = local_client(&server);

    let err = client
        .send_request(ask("nope", vec![Message::user("hi")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    let AiClientError::RetriesExhausted { attempts } = &err else {
        panic!("expected aggregate, got {err:?}");
    };
    assert!(attempts[0].message.contains("ollama pull nope"), "{}", attempts[0].message);
}

#[tokio::test]
async fn cancel_mid_flight_stops_request() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::ok(r#"{"response":"too late"}"#).delayed(Duration::from_secs(30)),
    })
    .await;
    let (client, sleeper) = local_client(&server);
    let client = Arc::new(client);

    let mut params = ask("llama3", vec![Message::user("long task")]);
    params.request_id = Some("node-9".into());
    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request(params).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request never reached the server");
    assert_eq!(client.in_flight(), vec!["node-9".to_string()]);

    assert!(client.cancel_request("node-9"));
    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancelled request did not finish")
        .unwrap()
        .unwrap_err();

    assert!(err.is_cancelled(), "{err:?}");
    assert!(!client.cancel_request("node-9"));
    assert!(client.in_flight().is_empty());
    // no further strategies after cancellation
    assert_eq!(server.requests().len(), 1);
    assert!(sleeper.recorded().is_empty());
}

#[tokio::test]
async fn concurrent_requests_have_distinct_ids() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::ok(r#"{"response":"ok"}"#).delayed(Duration::from_millis(50)),
    })
    .await;
    let (client, _) = local_client(&server);

    let (a, b) = tokio::join!(
        client.send_request(ask("starcoder2", vec![Message::user("a")])),
        client.send_request(ask("starcoder2", vec![Message::user("b")])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.request_id, b.request_id);
    assert!(client.in_flight().is_empty());
}

#[tokio::test]
async fn discovery_lists_local_models_after_cloud_ones() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(
            r#"{"models":[{"name":"llama3:8b","model":"llama3:8b","details":{"parameter_size":"8.0B"}},{"name":"mistral:latest","model":"mistral:latest"}]}"#,
        ),
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let (client, _) = local_client(&server);

    let models = client.get_available_models().await;
    let local: Vec<_> = models.iter().filter(|m| m.provider == Provider::Ollama).collect();
    assert_eq!(local.len(), 2);
    assert_eq!(local[0].id, "llama3:8b");
    assert_eq!(local[0].name, "llama3:8b (8.0B)");
    assert!(models.iter().any(|m| m.provider == Provider::OpenAi));
    let first_local = models.iter().position(|m| m.provider == Provider::Ollama).unwrap();
    assert!(models[..first_local].iter().all(|m| m.provider != Provider::Ollama));
}

#[tokio::test]
async fn discovery_failure_falls_back_to_default_entry() {
    let server = MockServer::start(|_| Reply::status(500, "down")).await;
    let (client, _) = local_client(&server);

    let models = client.get_available_models().await;
    let local: Vec<_> = models.iter().filter(|m| m.provider == Provider::Ollama).collect();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, FALLBACK_LOCAL_MODEL);
}

#[tokio::test]
async fn local_connection_test_single_attempt() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        "/api/chat" => Reply::ok(r#"{"message":{"role":"assistant","content":"H"}}"#),
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let (client, _) = local_client(&server);

    assert!(client.test_connection(Provider::Ollama, None, None).await);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn local_proxy_carries_chat_and_generate() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(r#"{"models":[{"name":"llama3:8b"}]}"#),
        "/local/chat" => Reply::status(503, "warming up"),
        "/local/generate" => Reply::ok(r#"{"response":"via proxy"}"#),
        _ => Reply::status(500, "unexpected"),
    })
    .await;
    let mut config = ServiceConfig::default();
    config.local_model_url = server.url.clone();
    config.local_proxy_url = Some(format!("{}/local/", server.url));
    let client = AiClient::with_sleeper(config, Arc::new(RecordingSleeper::new())).unwrap();

    let response = client
        .send_request(ask("llama3", vec![Message::user("hi")]))
        .await
        .unwrap();
    assert_eq!(response.text, "via proxy");
    assert_eq!(server.hits("/local/chat"), 3);
    assert_eq!(server.hits("/local/generate"), 1);
    assert_eq!(server.hits("/api/chat"), 0);
    assert_eq!(server.hits("/api/generate"), 0);

    let generate = server
        .requests()
        .into_iter()
        .find(|r| r.path == "/local/generate")
        .unwrap();
    assert_eq!(generate.json()["stream"], false);

    // Discovery stays on the server itself.
    let models = client.get_available_models().await;
    assert!(models.iter().any(|m| m.id == "llama3:8b"));
    assert!(server.hits("/api/tags") >= 1);
}

#[tokio::test]
async fn disabled_local_server_connection_test_makes_no_calls() {
    let server = MockServer::start(|_| Reply::ok(r#"{"response":"H"}"#)).await;
    let mut config = ServiceConfig::default();
    config.local_model_url = server.url.clone();
    config.local_model_enabled = false;
    let client = AiClient::new(config).unwrap();

    assert!(!client.test_connection(Provider::Ollama, None, None).await);
    assert!(server.requests().is_empty());
    assert_eq!(server.hits("/api/tags"), 0);
}

#[tokio::test]
async fn blank_proxy_url_joins_local_failures() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/api/tags" => Reply::ok(NO_TAGS),
        _ => Reply::status(500, "model crashed"),
    })
    .await;
    let mut config = ServiceConfig::default();
    config.local_model_url = server.url.clone();
    config.use_proxy = true;
    config.proxy_url = "  ".into();
    let client = AiClient::with_sleeper(config, Arc::new(RecordingSleeper::new())).unwrap();

    let err = client
        .send_request(ask("llama3", vec![Message::user("hi")]))
        .await
        .unwrap_err();

    let AiClientError::RetriesExhausted { attempts } = &err else {
        panic!("expected aggregate, got {err:?}");
    };
    assert_eq!(attempts.len(), 7);
    assert_eq!(attempts[5].strategy, "generate-api");
    assert_eq!(attempts[6].strategy, "generic");
    assert_eq!(attempts[6].kind, ErrorKind::Configuration);
    assert_eq!(server.requests().len(), 6);
    assert!(client.in_flight().is_empty());
}
