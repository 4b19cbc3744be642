use super::*;
use crate::mux::Multiplexer;
use crate::transport::{Wire, channel};
use frames::Frame;

fn setup() -> (Multiplexer, ChainQuery, Wire) {
    let (transport, wire) = channel("background");
    let mux = Multiplexer::new(transport);
    let provider = ProviderProxy::new(mux.create_channel("provider").expect("create"));
    (mux, ChainQuery::new(Arc::new(provider)), wire)
}

/// Answer the next request on the provider channel with `answer(request)`.
async fn serve_one(wire: &mut Wire, answer: impl FnOnce(&Value) -> Value) -> Value {
    let request = wire.next_outbound().await.expect("request");
    assert_eq!(request.name, "provider");
    wire.deliver(Frame::new("provider", answer(&request.data)));
    request.data
}

#[tokio::test]
async fn block_number_parses_hex() {
    let (_mux, chain, mut wire) = setup();

    let (number, request) = tokio::join!(
        chain.block_number(),
        serve_one(&mut wire, |req| json!({"jsonrpc": "2.0", "id": req["id"].clone(), "result": "0x1b4"}))
    );

    assert_eq!(number, Ok(436));
    assert_eq!(request, json!({"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []}));
}

#[tokio::test]
async fn balance_passes_address_and_block() {
    let (_mux, chain, mut wire) = setup();

    let (balance, request) = tokio::join!(
        chain.get_balance("0xabc", "latest"),
        serve_one(&mut wire, |req| json!({"id": req["id"].clone(), "result": "0xde0b6b3a7640000"}))
    );

    assert_eq!(balance, Ok(1_000_000_000_000_000_000));
    assert_eq!(request["params"], json!(["0xabc", "latest"]));
}

#[tokio::test]
async fn error_reply_is_a_remote_error() {
    let (_mux, chain, mut wire) = setup();

    let (result, _) = tokio::join!(
        chain.get_transaction_count("0xabc", "latest"),
        serve_one(&mut wire, |req| {
            json!({"id": req["id"].clone(), "error": {"code": -32000, "message": "header not found"}})
        })
    );

    assert_eq!(
        result,
        Err(LinkError::RemoteError { message: "header not found".into(), code: Some(-32000), data: None })
    );
}

#[tokio::test]
async fn request_ids_increase() {
    let (_mux, chain, mut wire) = setup();

    let (_, first) = tokio::join!(chain.chain_id(), serve_one(&mut wire, |_| json!({"result": "0x1"})));
    let (_, second) = tokio::join!(chain.chain_id(), serve_one(&mut wire, |_| json!({"result": "0x1"})));

    assert_eq!(first["id"], json!(1));
    assert_eq!(second["id"], json!(2));
}

#[test]
fn quantities() {
    assert_eq!(parse_quantity(&json!("0x0")), Ok(0));
    assert_eq!(parse_quantity(&json!("0XfF")), Ok(255));
    assert!(parse_quantity(&json!("ff")).is_err());
    assert!(parse_quantity(&json!("0x")).is_err());
    assert!(parse_quantity(&json!("0xzz")).is_err());
    assert!(parse_quantity(&json!(12)).is_err());
}

#[test]
fn oversized_quantity_does_not_fit_u64() {
    assert!(narrow(u128::from(u64::MAX) + 1).is_err());
    assert_eq!(narrow(7), Ok(7));
}
