#[derive(Debug, Default, Deserialize)]
struct ListKeysQuery {
    #[serde(default)]
    include_keys: bool,
}

#[derive(Debug, Serialize)]
struct CreatedKeyResponse {
    api_key: String,
    account_id: String,
    created_at_ms: u64,
}

#[derive(Debug, Serialize)]
struct DeletedKeyResponse {
    deleted: bool,
}

async fn list_keys(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<Vec<ApiKeyRecord>>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let mut keys = state
        .gateway
        .keys()
        .list_keys(&account_id)
        .await
        .map_err(|err| store_error_response(&state, err))?;

    if !query.include_keys {
        for key in &mut keys {
            key.key = "redacted".to_string();
        }
    }
    Ok(Json(keys))
}

async fn create_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let max = state.gateway.max_keys_per_account();
    let record = state
        .gateway
        .keys()
        .create_key(&account_id, max)
        .await
        .map_err(|err| store_error_response(&state, err))?;
    state
        .gateway
        .ledger()
        .get_or_create(&account_id)
        .await
        .map_err(|err| ledger_error_response(&state, err))?;
    tracing::info!(account_id = %account_id, key = %super::key_hint(&record.key), "api key created");

    Ok((
        StatusCode::CREATED,
        Json(CreatedKeyResponse {
            api_key: record.key,
            account_id: record.account_id,
            created_at_ms: record.created_at_ms,
        }),
    ))
}

async fn delete_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path((account_id, key)): Path<(String, String)>,
) -> Result<Json<DeletedKeyResponse>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let deleted = state
        .gateway
        .keys()
        .delete_key(&account_id, &key)
        .await
        .map_err(|err| store_error_response(&state, err))?;
    if !deleted {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "KEY_NOT_FOUND",
            "API key not found",
        ));
    }
    tracing::info!(account_id = %account_id, key = %super::key_hint(&key), "api key deleted");
    Ok(Json(DeletedKeyResponse { deleted: true }))
}
