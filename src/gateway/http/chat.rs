/// `POST /v1/chat/completions` and `POST /api/chat`.
///
/// The key comes from `x-api-key`, falling back to `Authorization: Bearer`.
/// The body is decoded here rather than by an extractor so malformed input
/// gets the same error envelope as every other failure.
async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChatCompletion>, (StatusCode, Json<ErrorResponse>)> {
    let api_key = extract_header(&headers, "x-api-key").or_else(|| extract_bearer(&headers));

    let request = match serde_json::from_slice::<ChatRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = if api_key.is_none() {
                GatewayError::MissingKey
            } else {
                GatewayError::InvalidRequest {
                    reason: format!("invalid request body: {err}"),
                }
            };
            tracing::warn!(code = err.code(), error = %err, "chat request rejected before metering");
            return Err(map_gateway_error(&state, &err));
        }
    };

    state
        .gateway
        .handle(api_key.as_deref(), request)
        .await
        .map(Json)
        .map_err(|err| map_gateway_error(&state, &err))
}
