#[macro_use]
extern crate clap;

use clap::{App, AppSettings, Arg, ArgMatches};
use env_logger::Env;
use rootlesskit::{
    activation,
    child::{self, mount::Propagation, ChildOpt},
    errors::LifecycleError,
    idmap::SubidSource,
    network::{self, NetworkOpts, ParentNetwork},
    parent::{self, ParentOpt},
    port::{self, portutil, PortSpec},
    statedir,
};
use std::{env, path::PathBuf, process, str::FromStr, sync::Arc};

fn main() {
    let matches = App::new("rootlesskit")
        .version(crate_version!())
        .about("the gate to the rootless world")
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .help("debug mode"),
        )
        .arg(
            Arg::with_name("state-dir")
                .long("state-dir")
                .takes_value(true)
                .help("state directory (defaults to a unique temp dir)"),
        )
        .arg(
            Arg::with_name("net")
                .long("net")
                .takes_value(true)
                .default_value("host")
                .possible_values(network::PARENT_DRIVER_NAMES)
                .help("network driver"),
        )
        .arg(
            Arg::with_name("mtu")
                .long("mtu")
                .takes_value(true)
                .default_value("0")
                .help("MTU for non-host network (0: driver default)"),
        )
        .arg(
            Arg::with_name("cidr")
                .long("cidr")
                .takes_value(true)
                .help("CIDR for the subnet of non-host networks (e.g. 10.0.2.0/24)"),
        )
        .arg(
            Arg::with_name("ifname")
                .long("ifname")
                .takes_value(true)
                .help("interface name inside the namespace"),
        )
        .arg(
            Arg::with_name("disable-host-loopback")
                .long("disable-host-loopback")
                .help("prohibit connecting to 127.0.0.1:* on the host namespace"),
        )
        .arg(
            Arg::with_name("ipv6")
                .long("ipv6")
                .help("enable IPv6 in supported network drivers (experimental)"),
        )
        .arg(
            Arg::with_name("slirp4netns-binary")
                .long("slirp4netns-binary")
                .takes_value(true)
                .help("path of the slirp4netns binary"),
        )
        .arg(
            Arg::with_name("copy-up")
                .long("copy-up")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("mount a filesystem and copy-up the directory contents"),
        )
        .arg(
            Arg::with_name("copy-up-mode")
                .long("copy-up-mode")
                .takes_value(true)
                .default_value("tmpfs+symlink")
                .possible_values(&["tmpfs+symlink"])
                .help("copy-up mode"),
        )
        .arg(
            Arg::with_name("port-driver")
                .long("port-driver")
                .takes_value(true)
                .default_value("none")
                .possible_values(&[
                    "none",
                    "builtin",
                    "slirp-like",
                    "slirp4netns",
                    "tap-vsock",
                    "gvisor-tap-vsock",
                ])
                .help("port driver for non-host network"),
        )
        .arg(
            Arg::with_name("publish")
                .long("publish")
                .short("p")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("publish ports, e.g. 8080:80/tcp (repeatable)"),
        )
        .arg(
            Arg::with_name("pidns")
                .long("pidns")
                .help("create a PID namespace"),
        )
        .arg(
            Arg::with_name("cgroupns")
                .long("cgroupns")
                .help("create a cgroup namespace"),
        )
        .arg(
            Arg::with_name("utsns")
                .long("utsns")
                .help("create a UTS namespace"),
        )
        .arg(
            Arg::with_name("ipcns")
                .long("ipcns")
                .help("create an IPC namespace"),
        )
        .arg(
            Arg::with_name("detach-netns")
                .long("detach-netns")
                .help("detach the network namespace into the state dir"),
        )
        .arg(
            Arg::with_name("propagation")
                .long("propagation")
                .takes_value(true)
                .default_value("rprivate")
                .possible_values(&["rprivate", "rslave", "rshared", "private", "slave", "shared"])
                .help("mount propagation for the child root"),
        )
        .arg(
            Arg::with_name("reaper")
                .long("reaper")
                .takes_value(true)
                .default_value("auto")
                .possible_values(&["auto", "true", "false"])
                .help("enable the process reaper (requires --pidns)"),
        )
        .arg(
            Arg::with_name("evacuate-cgroup2")
                .long("evacuate-cgroup2")
                .takes_value(true)
                .help("evacuate processes into the named cgroup2 before unsharing cgroupns"),
        )
        .arg(
            Arg::with_name("subid-source")
                .long("subid-source")
                .takes_value(true)
                .default_value("auto")
                .possible_values(&["auto", "static", "dynamic"])
                .help("source of the subordinate id configuration"),
        )
        .arg(
            Arg::with_name("print-semver")
                .long("print-semver")
                .takes_value(true)
                .possible_values(&["major", "minor", "patch"])
                .help("print a version component and exit"),
        )
        .arg(
            Arg::with_name("command")
                .multiple(true)
                .help("command to run inside the namespaces"),
        )
        .get_matches();

    let filter = if matches.is_present("debug") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();

    match run(&matches) {
        Ok(code) => process::exit(code),
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}

fn run(matches: &ArgMatches) -> Result<i32, LifecycleError> {
    if let Some(component) = matches.value_of("print-semver") {
        print_semver(component);
        return Ok(0);
    }
    let target_cmd: Vec<String> = matches
        .values_of("command")
        .map(|values| values.map(str::to_string).collect())
        .unwrap_or_default();
    if target_cmd.is_empty() {
        return Err(LifecycleError::Usage("no command specified".to_string()));
    }

    if env::var_os(activation::ACTIVATION_ENV_KEY).is_some() {
        // Re-stamp LISTEN_PID and re-exec ourselves; the normal flow
        // continues in the new image with valid activation descriptors.
        let mut argv = vec!["/proc/self/exe".to_string()];
        argv.extend(env::args().skip(1));
        activation::run(&argv)?;
        unreachable!();
    }

    if child::in_child_mode() {
        return child::run(child_opt(matches, target_cmd)?);
    }
    parent::run(parent_opt(matches, target_cmd)?)
}

fn print_semver(component: &str) {
    let version = crate_version!();
    let mut parts = version.splitn(3, '.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    let patch = parts.next().unwrap_or("0");
    match component {
        "major" => println!("{}", major),
        "minor" => println!("{}", minor),
        _ => println!("{}", patch),
    }
}

fn usage(message: impl Into<String>) -> LifecycleError {
    LifecycleError::Usage(message.into())
}

/// Flags shared by the parent and the re-executed child, validated once.
struct CommonOpt {
    net: String,
    port_driver: String,
    copy_up_dirs: Vec<PathBuf>,
    create_pidns: bool,
    detach_netns: bool,
    propagation: Propagation,
    evacuate_cgroup2: Option<String>,
    reaper: bool,
}

fn common_opt(matches: &ArgMatches) -> Result<CommonOpt, LifecycleError> {
    // Generic spellings (slirp-like, tap-vsock) fold into the concrete
    // driver names here, once, for both the parent and the re-executed
    // child.
    let net =
        network::canonical_driver_name(matches.value_of("net").unwrap_or("host")).to_string();
    let port_driver =
        network::canonical_driver_name(matches.value_of("port-driver").unwrap_or("none"))
            .to_string();
    let create_pidns = matches.is_present("pidns");

    if port_driver != "none" && net == "host" {
        return Err(usage(format!(
            "--port-driver={} requires a non-host --net",
            port_driver
        )));
    }
    if matches.is_present("detach-netns") && net == "host" {
        return Err(usage("--detach-netns requires a non-host --net"));
    }
    let evacuate_cgroup2 = matches.value_of("evacuate-cgroup2").map(str::to_string);
    if evacuate_cgroup2.is_some() && !matches.is_present("cgroupns") {
        return Err(usage("--evacuate-cgroup2 requires --cgroupns"));
    }
    if let Some(ifname) = matches.value_of("ifname") {
        if ifname.contains('/') {
            return Err(usage(format!("ifname {:?} must not contain '/'", ifname)));
        }
    }
    let reaper = match matches.value_of("reaper").unwrap_or("auto") {
        "true" => {
            if !create_pidns {
                return Err(usage("--reaper=true requires --pidns"));
            }
            true
        }
        "false" => false,
        _ => create_pidns,
    };
    let propagation = Propagation::from_str(matches.value_of("propagation").unwrap_or("rprivate"))
        .map_err(usage)?;
    let copy_up_dirs = matches
        .values_of("copy-up")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();

    Ok(CommonOpt {
        net,
        port_driver,
        copy_up_dirs,
        create_pidns,
        detach_netns: matches.is_present("detach-netns"),
        propagation,
        evacuate_cgroup2,
        reaper,
    })
}

fn child_opt(matches: &ArgMatches, target_cmd: Vec<String>) -> Result<ChildOpt, LifecycleError> {
    let common = common_opt(matches)?;
    Ok(ChildOpt {
        target_cmd,
        network_driver_name: common.net,
        port_driver_name: common.port_driver,
        copy_up_dirs: common.copy_up_dirs,
        create_pidns: common.create_pidns,
        detach_netns: common.detach_netns,
        propagation: common.propagation,
        mount_cgroup2: common.evacuate_cgroup2.is_some(),
        reaper: common.reaper,
    })
}

fn parent_opt(matches: &ArgMatches, _target_cmd: Vec<String>) -> Result<ParentOpt, LifecycleError> {
    let common = common_opt(matches)?;

    let mtu: u32 = matches
        .value_of("mtu")
        .unwrap_or("0")
        .parse()
        .map_err(|_| usage("--mtu must be an integer"))?;
    if mtu > 65521 {
        return Err(usage(format!("mtu {} must be in 0..=65521", mtu)));
    }

    let state_dir = match matches.value_of("state-dir") {
        Some(dir) => {
            let dir = PathBuf::from(dir);
            statedir::init_state_dir(&dir)?;
            dir
        }
        None => statedir::create_default_state_dir()?,
    };

    let network_opts = NetworkOpts {
        mtu,
        cidr: matches.value_of("cidr").map(str::to_string),
        disable_host_loopback: matches.is_present("disable-host-loopback"),
        ipv6: matches.is_present("ipv6"),
        ifname: matches.value_of("ifname").map(str::to_string),
        slirp4netns_binary: matches.value_of("slirp4netns-binary").map(str::to_string),
        enable_api_socket: common.port_driver == "slirp4netns",
    };
    let network: ParentNetwork = network::parent_driver_by_name(&common.net, &network_opts)?;

    let port_driver: Option<Arc<dyn port::ParentDriver>> = match common.port_driver.as_str() {
        "none" => None,
        "builtin" => Some(Arc::new(port::builtin::parent::Driver::new(&state_dir)?)),
        "slirp4netns" => {
            if common.net != "slirp4netns" {
                return Err(usage("--port-driver=slirp4netns requires --net=slirp4netns"));
            }
            Some(Arc::new(port::slirp4netns::Driver::new(
                &network::slirp4netns::api_socket_path(&state_dir),
            )?))
        }
        other => {
            return Err(LifecycleError::Port(
                rootlesskit::errors::PortError::NotCompiledIn(other.to_string()),
            ))
        }
    };

    let mut publish_ports: Vec<PortSpec> = Vec::new();
    if let Some(values) = matches.values_of("publish") {
        for value in values {
            publish_ports.push(portutil::parse_port_spec(value).map_err(|err| usage(err.to_string()))?);
        }
    }
    if !publish_ports.is_empty() && port_driver.is_none() {
        return Err(usage("-p/--publish requires --port-driver"));
    }

    Ok(ParentOpt {
        state_dir,
        network,
        port_driver,
        publish_ports,
        create_pidns: common.create_pidns,
        create_cgroupns: matches.is_present("cgroupns"),
        create_utsns: matches.is_present("utsns"),
        create_ipcns: matches.is_present("ipcns"),
        detach_netns: common.detach_netns,
        propagation: common.propagation,
        evacuate_cgroup2: common.evacuate_cgroup2,
        subid_source: SubidSource::from_str(matches.value_of("subid-source").unwrap_or("auto"))
            .map_err(usage)?,
    })
}
