mod common;

use axum::http::{Method, StatusCode};
use charavault_lib::{
    definition::extract_definition,
    server::create_router,
    store::{image_key, CardRepository, ImageVariant, NewCharacter, ObjectStore},
};
use chrono::Utc;
use common::fixtures::{card_uri, plain_png_uri, test_server, TINY_PNG};
use serde_json::json;
use tower::ServiceExt;

fn file(name: &str, content: String) -> serde_json::Value {
    json!({
        "name": name,
        "content": content,
        "lastModified": "1709294400000"
    })
}

#[tokio::test]
async fn upload_then_download_roundtrip() {
    let server = test_server();
    let app = create_router(server.state.clone());

    let res = app
        .clone()
        .oneshot(common::http::json_request(
            "/api/cards/upload",
            Method::POST,
            json!({
                "files": [file("foo.png", card_uri(r#"{"name":"Foo","description":"Bar"}"#))],
                "personalityToCreatorNotes": false
            }),
        ))
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::OK);
    let report = common::http::read_json_response(res).await;
    assert_eq!(report["inserted"][0]["name"], "Foo");
    let id = report["inserted"][0]["id"].as_i64().unwrap();

    let res = app
        .oneshot(common::http::get_request(&format!(
            "/api/cards/download?id={}",
            id
        )))
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::OK);
    let v = common::http::read_json_response(res).await;
    assert_eq!(v["name"], "Foo_2024-03-01_12-00-00.png");

    let json = extract_definition(v["card"].as_str().unwrap()).unwrap();
    let card: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(card["spec"], "chara_card_v2");
    assert_eq!(card["data"]["description"], "Bar");
}

#[tokio::test]
async fn upload_reports_duplicates_and_failures() {
    let server = test_server();
    let app = create_router(server.state.clone());
    let content = card_uri(r#"{"name":"Twice"}"#);

    let res = app
        .oneshot(common::http::json_request(
            "/api/cards/upload",
            Method::POST,
            json!({
                "files": [
                    file("a.png", content.clone()),
                    file("b.png", content),
                    file("plain.png", plain_png_uri()),
                ]
            }),
        ))
        .await
        .expect("request failed");

    assert_eq!(res.status(), StatusCode::OK);
    let report = common::http::read_json_response(res).await;
    assert_eq!(report["inserted"].as_array().unwrap().len(), 1);
    assert_eq!(report["duplicates"], json!(["b.png"]));
    assert_eq!(report["failed"][0]["fileName"], "plain.png");
    assert_eq!(report["failed"][0]["errorCode"], "DEFINITION_NOT_FOUND");
}

#[tokio::test]
async fn download_unknown_id_is_404() {
    let app = create_router(test_server().state);
    let res = app
        .oneshot(common::http::get_request("/api/cards/download?id=77"))
        .await
        .expect("request failed");

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let v = common::http::read_json_response(res).await;
    assert_eq!(v["error_code"], "NOT_FOUND");
}

#[tokio::test]
async fn patch_definition_updates_and_renames() {
    let server = test_server();
    let app = create_router(server.state.clone());

    let res = app
        .clone()
        .oneshot(common::http::json_request(
            "/api/cards/upload",
            Method::POST,
            json!({ "files": [file("a.png", card_uri(r#"{"name":"Before"}"#))] }),
        ))
        .await
        .expect("request failed");
    let report = common::http::read_json_response(res).await;
    let id = report["inserted"][0]["id"].as_i64().unwrap();

    let edited = r#"{"spec":"chara_card_v2","spec_version":"2.0","data":{"name":"After"}}"#;
    let res = app
        .clone()
        .oneshot(common::http::json_request(
            "/api/definitions",
            Method::PATCH,
            json!({ "id": id, "definition": edited }),
        ))
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(common::http::get_request(&format!("/api/definitions?id={}", id)))
        .await
        .expect("request failed");
    let v = common::http::read_json_response(res).await;
    assert_eq!(v["definitionJson"], edited);

    let character = server.repository.get_character(id).await.unwrap().unwrap();
    assert_eq!(character.char_name, "After");
    assert_eq!(server.repository.history(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn patch_with_invalid_json_is_400() {
    let server = test_server();
    let app = create_router(server.state.clone());

    let res = app
        .oneshot(common::http::json_request(
            "/api/definitions",
            Method::PATCH,
            json!({ "id": 1, "definition": "{not json" }),
        ))
        .await
        .expect("request failed");

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let v = common::http::read_json_response(res).await;
    assert_eq!(v["error_code"], "PARSE_ERROR");
}

#[tokio::test]
async fn migrate_task_fills_missing_definitions() {
    let server = test_server();
    let id = server
        .repository
        .insert_characters(vec![NewCharacter {
            char_name: String::new(),
            file_hash: "manual".to_string(),
            etag: "manual".to_string(),
            upload_date: Utc::now().naive_utc(),
            file_name: "manual.png".to_string(),
            source_uri: None,
        }])
        .await
        .unwrap()[0]
        .id;

    let png = charavault_lib::definition::embed_definition_into_png(TINY_PNG, r#"{"name":"Manual"}"#)
        .unwrap();
    server
        .objects
        .put(&image_key(ImageVariant::Full, id), png)
        .await
        .unwrap();

    let app = create_router(server.state.clone());
    let res = app
        .oneshot(common::http::json_request(
            "/api/tasks/definitions/migrate",
            Method::POST,
            json!({}),
        ))
        .await
        .expect("request failed");

    assert_eq!(res.status(), StatusCode::OK);
    let v = common::http::read_json_response(res).await;
    assert_eq!(v["updated"], 1);

    let definition = server.repository.get_definition(id).await.unwrap().unwrap();
    assert!(definition.tokens_total.is_some());
    assert!(definition.embedding.is_some());
}
