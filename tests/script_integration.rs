//! Integration tests for the script bridge objects.

mod common;

use std::fs;
use std::sync::Arc;

use common::{manifest, mentions, wait_for, GatedSender, TestHost, TestSender};
use luacord::{CommandOutcome, Event, Host, LuaCordError, PluginInstance, PluginState};

fn start(t: &TestHost) {
    t.loader.scan();
    t.loader.enable_all();
}

fn plugin(t: &TestHost, name: &str) -> Arc<PluginInstance> {
    t.state.find(name).expect("plugin is registered")
}

#[test]
fn test_require_evaluates_module_once() {
    let t = TestHost::new();
    t.dir_package(
        "Mods.lkt",
        &[
            ("plugin.yml", &manifest("Mods", "1.0.0")),
            (
                "main.lua",
                r#"
                local a = require("lib.counter")
                local b = require("lib.counter")
                local c = require_local("/lib/counter.lua")
                same = (a == b) and (b == c)
                value = a.value
                loads = counter_loads
                "#,
            ),
            (
                "lib/counter.lua",
                "counter_loads = (counter_loads or 0) + 1\nreturn { value = 42 }",
            ),
        ],
    );
    start(&t);

    let mods = plugin(&t, "Mods");
    assert_eq!(mods.global::<bool>("same"), Some(true));
    assert_eq!(mods.global::<i64>("value"), Some(42));
    assert_eq!(mods.global::<i64>("loads"), Some(1));
}

#[test]
fn test_missing_module_fails_load() {
    let t = TestHost::new();
    t.simple_package("Lost", "require_local('nowhere.to.be.found')");

    let report = t.loader.scan();
    assert_eq!(report.failed, vec!["Lost.lkt"]);
    let entry = t.state.error_log().last_error().unwrap();
    assert!(mentions(&entry, "nowhere/to/be/found.lua"));
}

#[test]
fn test_restricted_globals_are_removed() {
    let t = TestHost::new();
    t.simple_package(
        "Sandbox",
        "has_dofile = dofile ~= nil\nhas_loadfile = loadfile ~= nil\nhas_string = string ~= nil",
    );
    start(&t);

    let sandbox = plugin(&t, "Sandbox");
    assert_eq!(sandbox.global::<bool>("has_dofile"), Some(false));
    assert_eq!(sandbox.global::<bool>("has_loadfile"), Some(false));
    assert_eq!(sandbox.global::<bool>("has_string"), Some(true));
}

#[test]
fn test_instruction_limit_stops_runaway_script() {
    let t = TestHost::with_config(|config| config.scripting.max_instructions = 50_000);
    t.simple_package("Spin", "while true do end");
    t.simple_package("Calm", "local n = 0 for i = 1, 100 do n = n + i end total = n");

    let report = t.loader.scan();
    assert_eq!(report.loaded, vec!["Calm"]);
    assert_eq!(report.failed, vec!["Spin.lkt"]);
    let entry = t.state.error_log().last_error().unwrap();
    assert!(mentions(&entry, "instruction limit"));
}

#[test]
fn test_debug_flag_keeps_debug_library_out() {
    let t = TestHost::with_config(|config| config.debug = true);
    t.simple_package("Inspect", "has_debug = debug ~= nil");
    start(&t);

    assert_eq!(plugin(&t, "Inspect").global::<bool>("has_debug"), Some(false));
}

#[test]
fn test_environments_are_isolated() {
    let t = TestHost::new();
    t.simple_package("Left", "shared = 'left'");
    t.simple_package("Right", "seen = shared\nshared = 'right'");
    start(&t);

    assert_eq!(plugin(&t, "Left").global::<String>("shared").as_deref(), Some("left"));
    assert_eq!(plugin(&t, "Right").global::<String>("seen"), None);
}

const GIVE_COMMAND: &str = r#"
plugin.addCommand({
    name = "give",
    description = "Give an item",
    minArgs = 1,
    maxArgs = 2,
    permission = "shop.give",
}, function(cmd)
    given = table.concat(cmd:getArgs(), ",")
    cmd:getSender():sendMessage("ok")
end)
"#;

#[test]
fn test_command_argument_bounds() {
    let t = TestHost::new();
    t.simple_package("Shop", GIVE_COMMAND);
    start(&t);

    let sender = TestSender::player("Alice", &["shop.give"]);
    let dispatch = |line: &str| t.host.dispatch_command(sender.clone(), line);

    assert_eq!(dispatch("/give"), CommandOutcome::MissingArgs);
    assert_eq!(dispatch("/give a b c"), CommandOutcome::TooManyArgs);
    assert_eq!(dispatch("/give sword 2"), CommandOutcome::Executed);
    assert_eq!(dispatch("/shop:give bow"), CommandOutcome::Executed);

    assert_eq!(
        sender.messages(),
        vec!["ERROR! Missing args.", "ERROR! Too many args.", "ok", "ok"]
    );
    assert_eq!(plugin(&t, "Shop").global::<String>("given").as_deref(), Some("bow"));
}

#[test]
fn test_command_permission_is_checked() {
    let t = TestHost::new();
    t.simple_package("Shop", GIVE_COMMAND);
    start(&t);

    let sender = TestSender::player("Bob", &[]);
    assert_eq!(
        t.host.dispatch_command(sender.clone(), "/give sword"),
        CommandOutcome::NoPermission
    );
    assert_eq!(sender.messages(), vec!["ERROR! No permission."]);
    assert_eq!(plugin(&t, "Shop").global::<String>("given"), None);
}

#[test]
fn test_command_unavailable_until_enabled() {
    let t = TestHost::new();
    t.simple_package("Shop", GIVE_COMMAND);
    t.loader.scan();

    let sender = TestSender::console();
    assert_eq!(
        t.host.dispatch_command(sender.clone(), "/give sword"),
        CommandOutcome::Unavailable
    );

    t.loader.enable_all();
    assert_eq!(
        t.host.dispatch_command(sender, "/give sword"),
        CommandOutcome::Executed
    );
}

#[test]
fn test_command_failure_is_recorded() {
    let t = TestHost::new();
    t.simple_package(
        "Oops",
        "plugin.addCommand({ name = 'oops' }, function() error('command blew up') end)",
    );
    start(&t);

    let outcome = t.host.dispatch_command(TestSender::console(), "/oops");
    assert!(matches!(outcome, CommandOutcome::Failed(ref message) if message.contains("command blew up")));
    assert_eq!(t.state.error_log().len(), 1);
    assert_eq!(plugin(&t, "Oops").state(), luacord::PluginState::Enabled);
}

#[test]
fn test_async_command_runs_off_thread() {
    let t = TestHost::new();
    t.simple_package(
        "Slow",
        "plugin.addCommand({ name = 'slow', runAsync = true }, function(cmd) async_done = #cmd:getArgs() end)",
    );
    start(&t);

    assert_eq!(
        t.host.dispatch_command(TestSender::console(), "/slow a b"),
        CommandOutcome::Dispatched
    );
    let slow = plugin(&t, "Slow");
    assert!(wait_for(|| slow.global::<i64>("async_done") == Some(2)));
}

#[test]
fn test_disable_while_async_command_in_flight() {
    let t = TestHost::new();
    t.simple_package(
        "Worker",
        r#"
        plugin.addCommand({ name = "work", runAsync = true }, function(cmd)
            cmd:getSender():sendMessage("working")
            finished = true
        end)
        "#,
    );
    start(&t);
    let worker = plugin(&t, "Worker");

    let sender = GatedSender::new();
    assert_eq!(
        t.host.dispatch_command(sender.clone(), "/work"),
        CommandOutcome::Dispatched
    );
    assert!(wait_for(|| sender.entered() == 1));

    t.loader.disable(&worker).unwrap();
    assert_eq!(worker.state(), PluginState::Disabled);
    assert_eq!(
        t.host.dispatch_command(sender.clone(), "/work"),
        CommandOutcome::Unknown
    );
    assert_eq!(
        t.host.dispatch_command(sender.clone(), "/worker:work"),
        CommandOutcome::Unknown
    );
    assert!(t.host.commands().labels().is_empty());
    assert_eq!(t.state.plugins().len(), 1);

    sender.open();
    assert!(wait_for(|| worker.global::<bool>("finished") == Some(true)));
    assert_eq!(sender.entered(), 1);
    assert_eq!(worker.state(), PluginState::Disabled);
    assert!(t.host.commands().labels().is_empty());
    assert_eq!(t.state.plugins().len(), 1);

    t.loader.unload("Worker").unwrap();
    assert!(t.state.plugins().is_empty());
    assert!(t.host.plugin_names().is_empty());
    assert!(t.state.error_log().is_empty());
}

#[test]
fn test_tab_completion() {
    let t = TestHost::new();
    t.simple_package(
        "Warp",
        r#"
        local warp = plugin.addCommand({ name = "warp" }, function() end)
        warp:onTabComplete(function(sender, label, args)
            return { "spawn:" .. sender:getName(), label, args[1] }
        end)
        plugin.addCommand({ name = "tp" }, function() end)
        "#,
    );
    start(&t);
    t.host.add_player("Alice");
    t.host.add_player("Albert");
    t.host.add_player("Bob");

    let sender = TestSender::player("Carol", &[]);
    assert_eq!(
        t.host.tab_complete(sender.clone(), "/warp sh"),
        vec!["spawn:Carol", "warp", "sh"]
    );
    assert_eq!(t.host.tab_complete(sender, "/tp al"), vec!["Alice", "Albert"]);
}

#[test]
fn test_script_events_and_cancellation() {
    let t = TestHost::new();
    t.host
        .register_event_type("org.bukkit.event.player.PlayerJoinEvent");
    t.simple_package(
        "Guard",
        r#"
        plugin.registerEvent("PlayerJoinEvent", function(e)
            joined = e:get("player")
        end)
        plugin.registerEvent("LuaPluginLoadEvent", function(e)
            if e:get("file") == "Other.lkt" then e:setCancelled(true) end
        end)
        "#,
    );
    start(&t);

    let report = t
        .host
        .raise_event(&Event::new("org.bukkit.event.player.PlayerJoinEvent").with_field("player", "Alice"));
    assert_eq!(report.invoked, 1);
    assert_eq!(plugin(&t, "Guard").global::<String>("joined").as_deref(), Some("Alice"));

    let other = t.simple_package("Other", "");
    assert!(t.loader.load_and_enable(&other).unwrap().is_none());
    assert!(t.state.find("Other").is_none());
}

#[test]
fn test_config_defaults_and_save() {
    let t = TestHost::new();
    t.dir_package(
        "Cfg.lkt",
        &[
            ("plugin.yml", &manifest("Cfg", "1.0.0")),
            ("config.yml", "greeting: hello\nnested:\n  value: 3\n"),
            (
                "main.lua",
                r#"
                greeting = config.getValue("greeting")
                nested = config.getValue("nested.value")
                added = config.setDefault("limits.max", 10)
                config.set("greeting", "bye")
                config.save()
                "#,
            ),
        ],
    );
    start(&t);

    let cfg = plugin(&t, "Cfg");
    assert_eq!(cfg.global::<String>("greeting").as_deref(), Some("hello"));
    assert_eq!(cfg.global::<i64>("nested"), Some(3));
    assert_eq!(cfg.global::<bool>("added"), Some(true));

    let saved = fs::read_to_string(t.data_dir().join("Cfg/config.yml")).unwrap();
    assert!(saved.contains("greeting: bye"));
    assert!(saved.contains("max: 10"));
}

#[test]
fn test_storage_objects() {
    let t = TestHost::new();
    t.simple_package(
        "Stats",
        r#"
        local store = plugin.getStorageObject("stats.json")
        store:setDefaultValue("kills", 0)
        store:setValue("kills", 5)
        kills = store:getValue("kills")
        kind = store:getType()
        same = plugin.getStorageObject("stats.json"):getValue("kills")
        bad = pcall(plugin.getStorageObject, "stats.txt")
        "#,
    );
    start(&t);

    let stats = plugin(&t, "Stats");
    assert_eq!(stats.global::<i64>("kills"), Some(5));
    assert_eq!(stats.global::<String>("kind").as_deref(), Some("json"));
    assert_eq!(stats.global::<i64>("same"), Some(5));
    assert_eq!(stats.global::<bool>("bad"), Some(false));
    assert!(t
        .state
        .error_log()
        .last_error()
        .unwrap()
        .message
        .contains("stats.txt"));
}

#[test]
fn test_export_resource() {
    let t = TestHost::new();
    t.dir_package(
        "Res.lkt",
        &[
            ("plugin.yml", &manifest("Res", "1.0.0")),
            ("assets/readme.txt", "read me"),
            (
                "main.lua",
                "exported = plugin.exportResource('assets/readme.txt')\nmissing = plugin.exportResource('assets/none.txt')",
            ),
        ],
    );
    start(&t);

    let res = plugin(&t, "Res");
    assert_eq!(res.global::<bool>("exported"), Some(true));
    assert_eq!(res.global::<bool>("missing"), Some(false));
    assert_eq!(
        fs::read_to_string(t.data_dir().join("Res/readme.txt")).unwrap(),
        "read me"
    );
}

#[test]
fn test_plugin_accessors_and_logger() {
    let t = TestHost::new();
    t.dir_package(
        "Info.lkt",
        &[
            (
                "plugin.yml",
                "name: Info\nversion: 1.2.3\nmain: main.lua\ndescription: About\nauthor: Ann\nauthors: [Ben]\n",
            ),
            (
                "main.lua",
                r#"
                logger.info("starting")
                logger.debug("details")
                name = plugin.getName()
                version = plugin.getVersion()
                description = plugin.getDescription()
                authors = table.concat(plugin.getAuthors(), ",")
                naggable = plugin.isNaggable()
                plugin.setNaggable(false)
                "#,
            ),
        ],
    );
    start(&t);

    let info = plugin(&t, "Info");
    assert_eq!(info.global::<String>("name").as_deref(), Some("Info"));
    assert_eq!(info.global::<String>("version").as_deref(), Some("1.2.3"));
    assert_eq!(info.global::<String>("description").as_deref(), Some("About"));
    assert_eq!(info.global::<String>("authors").as_deref(), Some("Ann,Ben"));
    assert_eq!(info.global::<bool>("naggable"), Some(true));
    assert!(!info.core().is_naggable());
}

#[test]
fn test_util_helpers() {
    let t = TestHost::new();
    t.simple_package(
        "Util",
        r#"
        length = util.getTableLength({ 1, 2, x = 3 })
        list = util.getTableFromList({ "a", "b" })
        plugin.onEnable(function()
            util.runDelayed(function() delayed = true end, 20)
            util.runAsync(function() async_ran = true end)
        end)
        "#,
    );
    start(&t);

    let util = plugin(&t, "Util");
    assert_eq!(util.global::<i64>("length"), Some(3));
    assert_eq!(util.global::<Vec<String>>("list"), Some(vec!["a".to_string(), "b".to_string()]));
    assert_eq!(util.global::<bool>("delayed"), Some(true));
    assert!(wait_for(|| util.global::<bool>("async_ran") == Some(true)));
}

#[test]
fn test_lifecycle_callback_must_be_function() {
    let t = TestHost::new();
    t.simple_package("Bad", "plugin.onEnable('not a function')");

    let report = t.loader.scan();
    assert_eq!(report.failed, vec!["Bad.lkt"]);
    let entry = t.state.error_log().last_error().unwrap();
    assert!(mentions(&entry, "onEnable"));
    assert!(matches!(
        t.loader.unload("Bad"),
        Err(LuaCordError::NotFound(_))
    ));
}
