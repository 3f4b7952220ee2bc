//! JSON-RPC controller with a simulated gantry.
//!
//! Run with:
//!   cargo run -p labwire --example rpc-server
//!
//! In another terminal:
//!   cargo run -p labwire --example rpc-client -- /tmp/labwire-rpc-<pid>/controller.sock

use std::collections::BTreeMap;
use std::sync::Arc;

use labwire::logging::{init_logging, LogFormat, LogLevel};
use labwire::marshal::lab::{self, Axis, CriticalPoint, Mount, Point};
use labwire::peer::{JsonRpcServer, MethodError, MethodRegistry, MethodSpec, ParamSpec, Params, ServerConfig};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Default)]
struct Gantry {
    position: Point,
    homed: BTreeMap<Axis, bool>,
}

fn controller_methods(gantry: Arc<Mutex<Gantry>>) -> labwire::peer::Result<MethodRegistry> {
    let mut methods = MethodRegistry::new();

    let state = Arc::clone(&gantry);
    methods.register(
        MethodSpec::new("home")
            .param(ParamSpec::optional("axes", Value::Null).tagged(lab::AXIS_LIST))
            .returns(lab::AXIS_BOOL_MAP),
        move |params: Params| {
            let state = Arc::clone(&state);
            async move {
                let axes: Vec<Axis> = params.get_opt("axes")?.unwrap_or_else(|| Axis::ALL.to_vec());
                let mut gantry = state.lock().await;
                for axis in axes {
                    gantry.homed.insert(axis, true);
                }
                gantry.position = Point::default();
                Ok::<_, MethodError>(gantry.homed.clone())
            }
        },
    )?;

    let state = Arc::clone(&gantry);
    methods.register(
        MethodSpec::new("move_to")
            .param(ParamSpec::required("mount").tagged(lab::MOUNT))
            .param(ParamSpec::required("abs_position").tagged(lab::POINT))
            .param(ParamSpec::optional("critical_point", Value::Null).tagged(lab::OPTIONAL_CRITICAL_POINT))
            .returns(lab::POINT),
        move |params: Params| {
            let state = Arc::clone(&state);
            async move {
                let mount: Mount = params.get("mount")?;
                let target: Point = params.get("abs_position")?;
                let critical_point = params.get_opt::<Option<CriticalPoint>>("critical_point")?.flatten();
                tracing::info!(%mount, ?target, ?critical_point, "moving");
                let mut gantry = state.lock().await;
                gantry.position = target;
                Ok::<_, MethodError>(gantry.position)
            }
        },
    )?;

    let state = Arc::clone(&gantry);
    methods.register(MethodSpec::new("current_position").returns(lab::POINT), move |_params: Params| {
        let state = Arc::clone(&state);
        async move { Ok(state.lock().await.position) }
    })?;

    methods.register(
        MethodSpec::new("attached_instruments").returns(lab::MOUNT_STRING_MAP),
        |_params: Params| async move {
            Ok(BTreeMap::from([(Mount::Left, "p300_single_v2.0".to_string())]))
        },
    )?;

    Ok(methods)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Text, LogLevel::Debug);

    let sock_dir = std::env::temp_dir().join(format!("labwire-rpc-{}", std::process::id()));
    std::fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("controller.sock");

    let methods = controller_methods(Arc::default())?;
    let server = JsonRpcServer::new(methods, Arc::new(lab::standard_registry()?), ServerConfig::default());
    let handle = server.bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    tokio::signal::ctrl_c().await?;
    handle.stop().await;
    let _ = std::fs::remove_dir_all(&sock_dir);
    Ok(())
}
