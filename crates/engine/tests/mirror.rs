mod common;

use std::time::Duration;

use common::{MirrorWorld, settle};
use tandem_engine::mask::MASKED_MARKER;
use tandem_engine::{EventChannel, MemoryChannel, MirrorError, SessionLifecycle};
use tandem_protocol::{MirrorBody, MirrorKind, MutationKind, MutationPayload, PointerAction};
use uuid::Uuid;

const CHECKOUT: &str = concat!(
    r#"<html><head><style>.buy{color:red}</style></head><body>"#,
    r#"<main id="app"><h1 class="title">Checkout</h1>"#,
    r#"<ul class="items"><li>Socks</li><li>Hat</li></ul>"#,
    r#"<form id="pay"><input name="email" value="a@b.example">"#,
    r#"<input type="password" name="pw" value="secret123">"#,
    r#"<textarea name="card-notes">4111 1111</textarea>"#,
    r#"<button id="buy-button" class="buy" onclick="buy()">Buy</button></form>"#,
    r#"<script>track()</script></main></body></html>"#,
);

#[tokio::test]
async fn renderer_converges_on_the_masked_page() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();
    settle(&mut renderer).await;
    assert_eq!(renderer.surface().unwrap().markup(), world.expected_markup());

    let page = &world.page;
    let items = page.with_document(|doc| {
        doc.descendants(doc.root())
            .into_iter()
            .find(|&n| doc.attr(n, "class") == Some("items"))
            .unwrap()
    });
    let form = page.element_by_id("pay").unwrap();
    let button = page.element_by_id("buy-button").unwrap();

    page.append_html(items, "<li>Gloves</li><li class=\"sale\">Scarf</li>");
    page.set_attribute(button, "disabled", "");
    page.append_html(form, r#"<input name="cvv" value="123">"#);
    let first_item = page.with_document(|doc| doc.element_children(items).next().unwrap());
    page.remove_node(first_item);
    page.remove_attribute(button, "disabled");
    page.set_attribute(button, "class", "buy busy");
    page.append_html(items, "<script>evil()</script><li>Belt</li>");
    page.set_attribute(button, "onmouseover", "x()");

    settle(&mut renderer).await;
    let rendered = renderer.surface().unwrap().markup();
    assert_eq!(rendered, world.expected_markup());
    assert!(rendered.contains("<li>Hat</li><li>Gloves</li>"));
    assert!(!rendered.contains("Socks"));
    assert!(!rendered.contains("secret123"));
    assert!(!rendered.contains(r#"value="123""#));
    assert!(!rendered.contains("4111"));
    assert!(!rendered.contains("<script"));
    assert!(!rendered.contains("onclick"));

    capture.stop().await;
}

#[tokio::test]
async fn unresolvable_mutations_are_dropped_without_breaking_the_stream() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();
    settle(&mut renderer).await;

    // A mutation published for a path the renderer cannot resolve
    let bogus = MirrorBody::Mutation(MutationPayload {
        mutation_kind: MutationKind::NodeListChange,
        target_path: "#does-not-exist > div".into(),
        added_fragments: Some(vec!["<p>ghost</p>".into()]),
        removed_tags: None,
        attribute_name: None,
        attribute_value: None,
        timestamp: 1,
    });
    inject(&world.channel, world.session.id, bogus).await;

    let app = world.page.element_by_id("app").unwrap();
    world.page.append_html(app, "<footer>Thanks</footer>");
    settle(&mut renderer).await;

    let rendered = renderer.surface().unwrap().markup();
    assert!(!rendered.contains("ghost"));
    assert_eq!(rendered, world.expected_markup());
}

async fn inject(channel: &MemoryChannel, session_id: Uuid, body: MirrorBody) {
    channel
        .append_mirror(session_id, body.kind(), body.to_payload().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn masked_password_never_reaches_the_renderer() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();

    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();
    settle(&mut renderer).await;

    // The visitor keeps typing into the password field
    let pw = world.page.with_document(|doc| {
        doc.descendants(doc.root())
            .into_iter()
            .find(|&n| doc.attr(n, "name") == Some("pw"))
            .unwrap()
    });
    world.page.set_attribute(pw, "value", "secret1234");
    settle(&mut renderer).await;

    let surface = renderer.surface().unwrap();
    let doc = &surface.document;
    let field = doc
        .descendants(doc.root())
        .into_iter()
        .find(|&n| doc.attr(n, "name") == Some("pw"))
        .unwrap();
    assert_eq!(doc.attr(field, "value"), Some("••••••••"));
    assert_eq!(doc.attr(field, MASKED_MARKER), Some("true"));
    assert!(!surface.markup().contains("secret"));

    // The live page still holds the real value
    world
        .page
        .with_document(|doc| assert_eq!(doc.attr(pw, "value"), Some("secret1234")));
}

#[tokio::test]
async fn text_added_inside_a_masked_textarea_stays_on_the_page() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    let mut log = world.channel.subscribe_mirror(world.session.id).await.unwrap();

    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();
    settle(&mut renderer).await;

    let notes = world.page.with_document(|doc| {
        doc.descendants(doc.root())
            .into_iter()
            .find(|&n| doc.attr(n, "name") == Some("card-notes"))
            .unwrap()
    });
    world.page.append_html(notes, "5500 0000 0000 0004");
    let form = world.page.element_by_id("pay").unwrap();
    world.page.append_html(form, "<p>Thanks</p>");
    settle(&mut renderer).await;

    let mut mutations = 0;
    while let Some(event) = log.try_recv() {
        assert!(!event.payload.to_string().contains("5500"));
        if event.kind == MirrorKind::Mutation {
            mutations += 1;
        }
    }
    // Only the sibling paragraph went out
    assert_eq!(mutations, 1);

    let rendered = renderer.surface().unwrap().markup();
    assert!(!rendered.contains("5500"));
    assert!(!rendered.contains("4111"));
    assert!(rendered.contains("<p>Thanks</p>"));
    assert_eq!(rendered, world.expected_markup());
}

#[tokio::test(start_paused = true)]
async fn pointer_moves_are_throttled_and_clicks_always_sent() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    let mut sub = world.channel.subscribe_mirror(world.session.id).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().kind, MirrorKind::Snapshot);

    // 20 moves 10 ms apart span 200 ms: at most one per 50 ms window
    for i in 0..20 {
        world.page.pointer_move(i as f64, 0.0);
        if i == 7 {
            world.page.click(7.0, 0.0);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut moves = 0;
    let mut clicks = 0;
    while let Some(event) = sub.try_recv() {
        if let Ok(MirrorBody::Pointer(pointer)) = event.body() {
            match pointer.action {
                PointerAction::Move => moves += 1,
                PointerAction::Click => clicks += 1,
            }
        }
    }
    assert_eq!(clicks, 1);
    assert!((1..=4).contains(&moves), "moves = {moves}");
    capture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn highlight_outlines_the_target_then_fades() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();

    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();
    settle(&mut renderer).await;

    let button = renderer
        .surface()
        .unwrap()
        .document
        .element_by_id("buy-button")
        .unwrap();
    let sent = renderer.highlight(button).await.unwrap();
    assert_eq!(sent.target_path, "#buy-button");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let outlines = world.page.outlines();
    assert_eq!(outlines.len(), 1);
    assert_eq!(Some(outlines[0].node), world.page.element_by_id("buy-button"));
    assert_eq!(outlines[0].color, world.config.highlight_color);

    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(world.page.outlines().len(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(world.page.outlines().is_empty());

    capture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn highlight_of_missing_target_is_ignored() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    let mut renderer = world.renderer();
    renderer.attach(world.session.id).await.unwrap();

    renderer.highlight_path("#no-such-element").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(world.page.outlines().is_empty());
    assert!(capture.is_capturing());

    // Capture keeps working afterwards
    let app = world.page.element_by_id("app").unwrap();
    world.page.append_html(app, "<aside>Help</aside>");
    settle(&mut renderer).await;
    assert!(renderer.surface().unwrap().markup().contains("<aside>Help</aside>"));
    capture.stop().await;
}

#[tokio::test]
async fn finish_ends_the_session_and_blocks_new_viewers() {
    let world = MirrorWorld::new(CHECKOUT).await;
    let mut capture = world.capture();
    capture.start(world.session.id).await.unwrap();
    capture.finish().await.unwrap();
    assert!(!world.page.is_observed());

    let session = world.sessions.mirror_session(world.session.id).await.unwrap();
    assert!(!session.is_active());
    assert!(session.ended_at.is_some());

    let mut renderer = world.renderer();
    assert!(matches!(
        renderer.attach(world.session.id).await,
        Err(MirrorError::Session(_))
    ));
}
