use tokio::net::TcpListener;

/// Standalone mock upstream. Point the `todo-batch` CLI at it with
/// `--base-url http://127.0.0.1:<PORT>`.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("mock upstream listening on {addr} (endpoints: /sync, /tasks/{{id}})");
    mock_server::run(listener).await
}
